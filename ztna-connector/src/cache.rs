//! Cached policy enforcement engine.
//!
//! The cache holds the last verified, unexpired policy snapshot as a set of
//! derived lookup indices, so a per-flow admission decision is O(1) expected
//! (plus a linear scan of the CIDR list). Replacing a snapshot rebuilds
//! every index in locals and swaps them under the write lock; readers never
//! observe a partially built index set.
//!
//! Deny by default: no decision is ever served from an unverified or
//! expired snapshot, and any uncertain state produces a deny with a
//! specific reason.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;
use tracing::{debug, warn};

use ztna_proto::message::{AclAuthorization, AclFilter, AclResource};
use ztna_proto::snapshot::{self, PolicyResource, PolicySnapshot};

/// Decision reasons surfaced in audit records.
pub mod reason {
    pub const ALLOWED: &str = "allowed";
    pub const NOT_ALLOWED: &str = "not_allowed";
    pub const RESOURCE_NOT_FOUND: &str = "resource_not_found";
    pub const NO_SNAPSHOT: &str = "no_snapshot";
    pub const SNAPSHOT_EXPIRED: &str = "snapshot_expired";
    pub const FILTER_DENIED: &str = "filter_denied";
    pub const INVALID_REQUEST: &str = "invalid_request";
}

/// Outcome of a policy lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub resource_id: String,
    pub reason: &'static str,
}

impl Decision {
    fn deny(reason: &'static str) -> Self {
        Decision {
            allowed: false,
            resource_id: String::new(),
            reason,
        }
    }

    fn deny_on(resource_id: &str, reason: &'static str) -> Self {
        Decision {
            allowed: false,
            resource_id: resource_id.to_string(),
            reason,
        }
    }

    fn allow(resource_id: &str) -> Self {
        Decision {
            allowed: true,
            resource_id: resource_id.to_string(),
            reason: reason::ALLOWED,
        }
    }
}

/// Derived lookup state for one verified snapshot.
#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<String, PolicyResource>,
    /// lower(address) → resource ids, for dns resources.
    by_dns: HashMap<String, Vec<String>>,
    /// dns resources whose address is already an IP literal.
    by_ip: HashMap<IpAddr, Vec<String>>,
    /// Insertion order preserved; matched by linear scan.
    by_cidr: Vec<(IpNet, String)>,
    internet_ids: Vec<String>,
    /// `identity::resource_id` → per-edge filters (empty = unconditional).
    acl: HashMap<String, Vec<AclFilter>>,
    valid_until: DateTime<Utc>,
}

fn acl_key(identity: &str, resource_id: &str) -> String {
    format!("{identity}::{resource_id}")
}

impl Indices {
    fn index_resource(&mut self, res: PolicyResource) {
        let id = res.resource_id.clone();
        match res.resource_type.as_str() {
            "dns" => {
                if let Ok(ip) = res.address.parse::<IpAddr>() {
                    self.by_ip.entry(ip).or_default().push(id.clone());
                } else {
                    self.by_dns
                        .entry(res.address.to_lowercase())
                        .or_default()
                        .push(id.clone());
                }
            }
            "cidr" => {
                if let Ok(net) = res.address.parse::<IpNet>() {
                    self.by_cidr.push((net, id.clone()));
                }
            }
            "internet" => self.internet_ids.push(id.clone()),
            // Unknown types contribute no candidates.
            _ => {}
        }
        self.by_id.insert(id, res);
    }

    fn drop_resource(&mut self, resource_id: &str) {
        self.by_id.remove(resource_id);
        for ids in self.by_dns.values_mut() {
            ids.retain(|id| id != resource_id);
        }
        self.by_dns.retain(|_, ids| !ids.is_empty());
        for ids in self.by_ip.values_mut() {
            ids.retain(|id| id != resource_id);
        }
        self.by_ip.retain(|_, ids| !ids.is_empty());
        self.by_cidr.retain(|(_, id)| id != resource_id);
        self.internet_ids.retain(|id| id != resource_id);
        self.acl.retain(|key, _| {
            key.rsplit_once("::")
                .map(|(_, rid)| rid != resource_id)
                .unwrap_or(true)
        });
    }
}

/// The connector-side policy cache.
pub struct PolicyCache {
    signing_key: Vec<u8>,
    stale_grace: Duration,
    inner: RwLock<Option<Indices>>,
}

impl PolicyCache {
    pub fn new(signing_key: Vec<u8>, stale_grace: StdDuration) -> Self {
        PolicyCache {
            signing_key,
            stale_grace: Duration::from_std(stale_grace).unwrap_or_else(|_| Duration::seconds(600)),
            inner: RwLock::new(None),
        }
    }

    /// Whether a verified snapshot is currently installed.
    pub fn has_snapshot(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Drop all indices; every subsequent lookup denies with `no_snapshot`.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Install a snapshot after verifying its signature and freshness.
    ///
    /// Returns false and clears the cache on any failure: an attacker (or a
    /// bug) must never leave stale indices serving decisions.
    pub fn replace(&self, snap: PolicySnapshot) -> bool {
        if !snapshot::verify(&self.signing_key, &snap) {
            warn!(
                connector_id = %snap.snapshot_meta.connector_id,
                "snapshot signature invalid, clearing policy cache"
            );
            self.clear();
            return false;
        }
        let valid_until = match DateTime::parse_from_rfc3339(&snap.snapshot_meta.valid_until) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                warn!("snapshot missing or invalid valid_until, clearing policy cache");
                self.clear();
                return false;
            }
        };
        if Utc::now() > valid_until + self.stale_grace {
            warn!(
                valid_until = %snap.snapshot_meta.valid_until,
                "snapshot already expired beyond grace, clearing policy cache"
            );
            self.clear();
            return false;
        }

        let mut ix = Indices {
            valid_until,
            ..Indices::default()
        };
        for res in snap.resources {
            for identity in &res.allowed_identities {
                ix.acl.insert(acl_key(identity, &res.resource_id), Vec::new());
            }
            ix.index_resource(res);
        }
        debug!(
            version = snap.snapshot_meta.policy_version,
            resources = ix.by_id.len(),
            acl_entries = ix.acl.len(),
            "policy snapshot installed"
        );
        *self.inner.write() = Some(ix);
        true
    }

    /// Apply an incremental resource upsert from the control stream.
    ///
    /// Delta-borne resources carry no protocol/port policy of their own;
    /// constraints come from authorization-edge filters.
    pub fn upsert_resource(&self, res: AclResource) {
        let mut guard = self.inner.write();
        let Some(ix) = guard.as_mut() else {
            return;
        };
        ix.drop_resource(&res.id);
        let normalized = snapshot::normalize_resource_type(&res.resource_type, &res.address);
        ix.index_resource(PolicyResource {
            resource_id: res.id,
            resource_type: normalized.to_string(),
            address: res.address,
            port: 0,
            protocol: String::new(),
            port_from: None,
            port_to: None,
            allowed_identities: Vec::new(),
        });
    }

    pub fn remove_resource(&self, resource_id: &str) {
        let mut guard = self.inner.write();
        if let Some(ix) = guard.as_mut() {
            ix.drop_resource(resource_id);
        }
    }

    pub fn upsert_authorization(&self, auth: AclAuthorization) {
        let mut guard = self.inner.write();
        if let Some(ix) = guard.as_mut() {
            ix.acl
                .insert(acl_key(&auth.principal_spiffe, &auth.resource_id), auth.filters);
        }
    }

    pub fn remove_authorization(&self, resource_id: &str, principal_spiffe: &str) {
        let mut guard = self.inner.write();
        if let Some(ix) = guard.as_mut() {
            ix.acl.remove(&acl_key(principal_spiffe, resource_id));
        }
    }

    /// Evaluate `(identity, destination, protocol, port)` against the cache.
    ///
    /// The stale grace applies to `replace` only; a lookup past
    /// `valid_until` denies immediately.
    pub fn allowed(&self, identity: &str, dest: &str, protocol: &str, port: u16) -> Decision {
        let guard = self.inner.read();
        let Some(ix) = guard.as_ref() else {
            return Decision::deny(reason::NO_SNAPSHOT);
        };
        if Utc::now() > ix.valid_until {
            return Decision::deny(reason::SNAPSHOT_EXPIRED);
        }

        // Candidate construction. CIDR resources match only IP-literal
        // destinations; hostnames are never resolved here.
        let mut candidates: Vec<&str> = Vec::new();
        if let Ok(ip) = dest.parse::<IpAddr>() {
            if let Some(ids) = ix.by_ip.get(&ip) {
                candidates.extend(ids.iter().map(String::as_str));
            }
            for (net, id) in &ix.by_cidr {
                if net.contains(&ip) {
                    candidates.push(id.as_str());
                }
            }
        } else if !dest.is_empty() {
            if let Some(ids) = ix.by_dns.get(&dest.to_lowercase()) {
                candidates.extend(ids.iter().map(String::as_str));
            }
        }
        if candidates.is_empty() {
            candidates.extend(ix.internet_ids.iter().map(String::as_str));
        }
        if candidates.is_empty() {
            return Decision::deny(reason::RESOURCE_NOT_FOUND);
        }

        let mut seen = HashSet::new();
        let mut filter_denied: Option<&str> = None;
        for id in candidates {
            if !seen.insert(id) {
                continue;
            }
            let Some(res) = ix.by_id.get(id) else {
                continue;
            };
            if !res.protocol.is_empty()
                && !protocol.is_empty()
                && !res.protocol.eq_ignore_ascii_case(protocol)
            {
                continue;
            }
            if !port_matches(res, port) {
                continue;
            }
            match ix.acl.get(&acl_key(identity, id)) {
                None => continue,
                Some(filters) if filters.is_empty() => return Decision::allow(id),
                Some(filters) => {
                    if filters.iter().any(|f| filter_matches(f, protocol, port)) {
                        return Decision::allow(id);
                    }
                    filter_denied.get_or_insert(id);
                }
            }
        }
        match filter_denied {
            Some(id) => Decision::deny_on(id, reason::FILTER_DENIED),
            None => Decision::deny(reason::NOT_ALLOWED),
        }
    }
}

/// Resource port policy. With no range set, `port == resource.port`, where
/// a zero resource port matches anything. With a range set, the effective
/// range is `[from, from]` when `to` is zero, and zero-zero matches
/// anything.
fn port_matches(res: &PolicyResource, port: u16) -> bool {
    match (res.port_from, res.port_to) {
        (None, None) => res.port == 0 || res.port == port,
        (from, to) => {
            let start = from.unwrap_or(0);
            let end = match to {
                Some(0) | None => start,
                Some(end) => end,
            };
            if start == 0 && end == 0 {
                return true;
            }
            port >= start && port <= end
        }
    }
}

fn filter_matches(filter: &AclFilter, protocol: &str, port: u16) -> bool {
    if !protocol.is_empty() && !filter.protocol.eq_ignore_ascii_case(protocol) {
        return false;
    }
    if filter.port_range_start == 0 && filter.port_range_end == 0 {
        return true;
    }
    if port == 0 {
        return false;
    }
    let start = filter.port_range_start;
    let end = if filter.port_range_end == 0 {
        start
    } else {
        filter.port_range_end
    };
    port >= start && port <= end
}
