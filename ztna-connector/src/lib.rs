//! ZTNA connector library.
//!
//! The connector enrolls with the controller, keeps a verified policy
//! snapshot cached locally, and answers tunneler admission requests from
//! that cache even when the control plane is unreachable.

pub mod allowlist;
pub mod cache;
pub mod certstore;
pub mod config;
pub mod enroll;
pub mod renewal;
pub mod session;
pub mod tls;
pub mod tunneler;
