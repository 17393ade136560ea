//! Shared protocol crate for the ZTNA control plane.
//!
//! Both the controller and the connector depend on this crate for:
//! - the control-plane wire messages ([`message`]),
//! - the signed policy snapshot format and its codec ([`snapshot`]),
//! - SPIFFE identity parsing ([`spiffe`]),
//! - TLS peer-identity and CA-bundle helpers ([`identity`]).

pub mod identity;
pub mod message;
pub mod snapshot;
pub mod spiffe;

pub use message::ControlMessage;
pub use snapshot::{PolicyResource, PolicySnapshot, SnapshotMeta};
pub use spiffe::{Role, SpiffeId};
