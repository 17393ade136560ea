//! Tunneler allowlist.
//!
//! The controller pushes the set of admitted tunneler SPIFFE IDs on every
//! fresh session (`tunneler_allowlist`) and single admissions in between
//! (`tunneler_allow`). Streams from callers outside the set are rejected.

use std::collections::HashSet;

use parking_lot::RwLock;

use ztna_proto::message::TunnelerInfo;

#[derive(Debug, Default)]
pub struct TunnelerAllowlist {
    by_spiffe: RwLock<HashSet<String>>,
}

impl TunnelerAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, spiffe_id: &str) -> bool {
        self.by_spiffe.read().contains(spiffe_id)
    }

    /// Replace the whole set with the controller's current list.
    pub fn replace(&self, items: &[TunnelerInfo]) {
        let next: HashSet<String> = items
            .iter()
            .filter(|item| !item.spiffe_id.is_empty())
            .map(|item| item.spiffe_id.clone())
            .collect();
        *self.by_spiffe.write() = next;
    }

    pub fn add(&self, spiffe_id: &str) {
        if spiffe_id.is_empty() {
            return;
        }
        self.by_spiffe.write().insert(spiffe_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.by_spiffe.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_spiffe.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, spiffe: &str) -> TunnelerInfo {
        TunnelerInfo {
            tunneler_id: id.to_string(),
            spiffe_id: spiffe.to_string(),
        }
    }

    #[test]
    fn replace_swaps_the_set() {
        let list = TunnelerAllowlist::new();
        list.add("spiffe://td/tunneler/old");
        list.replace(&[info("t1", "spiffe://td/tunneler/t1")]);
        assert!(list.contains("spiffe://td/tunneler/t1"));
        assert!(!list.contains("spiffe://td/tunneler/old"));
    }

    #[test]
    fn empty_spiffe_ids_are_ignored() {
        let list = TunnelerAllowlist::new();
        list.replace(&[info("t1", ""), info("t2", "spiffe://td/tunneler/t2")]);
        assert_eq!(list.len(), 1);
        list.add("");
        assert_eq!(list.len(), 1);
    }
}
