//! Policy compilation.

pub mod compiler;

pub use compiler::{compile, CompileError};
