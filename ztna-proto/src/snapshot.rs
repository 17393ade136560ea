//! Signed policy snapshots.
//!
//! A snapshot is the unit of policy distribution: the full set of resources
//! a connector may see, plus the identities allowed to reach each one. The
//! controller signs the canonical JSON form with HMAC-SHA256 and the
//! connector refuses to serve decisions from anything it cannot verify.
//!
//! Canonical form: resources sorted by `resource_id`, each
//! `allowed_identities` sorted ascending, `signature` empty while hashing.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub snapshot_meta: SnapshotMeta,
    pub resources: Vec<PolicyResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub connector_id: String,
    pub policy_version: i64,
    /// RFC 3339 timestamp of compilation.
    pub compiled_at: String,
    /// RFC 3339 timestamp after which the snapshot is stale.
    pub valid_until: String,
    /// Lowercase hex HMAC-SHA256 over the canonical form.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResource {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub address: String,
    /// Single port, or 0 for "any" (also 0 when a real range is set).
    pub port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_from: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_to: Option<u16>,
    pub allowed_identities: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("signing key not configured")]
    KeyMissing,
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sort the snapshot into canonical order in place.
pub fn normalize(snap: &mut PolicySnapshot) {
    snap.resources
        .sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
    for res in &mut snap.resources {
        res.allowed_identities.sort();
    }
}

/// Compute the HMAC-SHA256 signature of the snapshot's canonical form,
/// lowercase hex encoded. The caller stores the result in
/// `snapshot_meta.signature`.
pub fn sign(key: &[u8], snap: &PolicySnapshot) -> Result<String, SnapshotError> {
    if key.is_empty() {
        return Err(SnapshotError::KeyMissing);
    }
    let mut unsigned = snap.clone();
    unsigned.snapshot_meta.signature = String::new();
    let data = serde_json::to_vec(&unsigned)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SnapshotError::KeyMissing)?;
    mac.update(&data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify the signature stored in `snapshot_meta.signature`.
///
/// Accepts an optional `sha256:` prefix on the stored value. Uses a
/// constant-time comparison. Any defect (empty key, undecodable hex,
/// encode failure, mismatch) verifies as false.
pub fn verify(key: &[u8], snap: &PolicySnapshot) -> bool {
    if key.is_empty() {
        return false;
    }
    let presented = snap.snapshot_meta.signature.trim();
    let presented = presented.strip_prefix("sha256:").unwrap_or(presented);
    let presented = match hex::decode(presented) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut unsigned = snap.clone();
    unsigned.snapshot_meta.signature = String::new();
    let data = match serde_json::to_vec(&unsigned) {
        Ok(data) => data,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(&data);
    mac.verify_slice(&presented).is_ok()
}

/// SHA-256 content hash over the resource list alone, used for version
/// bookkeeping: unchanged content must produce an unchanged hash.
pub fn content_hash(resources: &[PolicyResource]) -> String {
    #[derive(Serialize)]
    struct Payload<'a> {
        resources: &'a [PolicyResource],
    }
    let data = serde_json::to_vec(&Payload { resources }).unwrap_or_default();
    hex::encode(Sha256::digest(&data))
}

/// Normalize a stored resource type against its address.
///
/// Explicit `cidr`/`dns`/`internet` win. Otherwise `*` (or `internet`)
/// means internet, a parseable CIDR means cidr, and anything else is dns.
pub fn normalize_resource_type(resource_type: &str, address: &str) -> &'static str {
    match resource_type.trim().to_ascii_lowercase().as_str() {
        "cidr" => return "cidr",
        "dns" => return "dns",
        "internet" => return "internet",
        _ => {}
    }
    if address.is_empty() {
        return "dns";
    }
    let addr = address.trim().to_ascii_lowercase();
    if addr == "*" || addr == "internet" {
        return "internet";
    }
    if addr.contains('/') && addr.parse::<ipnet::IpNet>().is_ok() {
        return "cidr";
    }
    "dns"
}
