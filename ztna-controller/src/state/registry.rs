//! Fleet registries.
//!
//! Process-wide views of connector and tunneler liveness, plus the
//! directory of admitted tunnelers that seeds every connector's local
//! allowlist. All three are narrow RW-locked maps; persistence happens at
//! the call sites that record heartbeats.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use ztna_proto::message::TunnelerInfo;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorRecord {
    pub connector_id: String,
    pub private_ip: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    records: RwLock<HashMap<String, ConnectorRecord>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_heartbeat(&self, connector_id: &str, private_ip: &str, status: &str) -> ConnectorRecord {
        let record = ConnectorRecord {
            connector_id: connector_id.to_string(),
            private_ip: private_ip.to_string(),
            status: status.to_string(),
            last_seen: Utc::now(),
        };
        self.records
            .write()
            .insert(connector_id.to_string(), record.clone());
        record
    }

    pub fn get(&self, connector_id: &str) -> Option<ConnectorRecord> {
        self.records.read().get(connector_id).cloned()
    }

    pub fn delete(&self, connector_id: &str) {
        self.records.write().remove(connector_id);
    }

    pub fn list(&self) -> Vec<ConnectorRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        records
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelerRecord {
    pub tunneler_id: String,
    pub spiffe_id: String,
    pub connector_id: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TunnelerStatusRegistry {
    records: RwLock<HashMap<String, TunnelerRecord>>,
}

impl TunnelerStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        tunneler_id: &str,
        spiffe_id: &str,
        connector_id: &str,
        status: &str,
    ) -> TunnelerRecord {
        let record = TunnelerRecord {
            tunneler_id: tunneler_id.to_string(),
            spiffe_id: spiffe_id.to_string(),
            connector_id: connector_id.to_string(),
            status: status.to_string(),
            last_seen: Utc::now(),
        };
        self.records
            .write()
            .insert(tunneler_id.to_string(), record.clone());
        record
    }

    pub fn list(&self) -> Vec<TunnelerRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.tunneler_id.cmp(&b.tunneler_id));
        records
    }
}

/// Admitted tunnelers: the source of every connector's local allowlist.
#[derive(Debug, Default)]
pub struct TunnelerDirectory {
    by_id: RwLock<HashMap<String, String>>,
}

impl TunnelerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tunneler_id: &str, spiffe_id: &str) {
        if tunneler_id.is_empty() || spiffe_id.is_empty() {
            return;
        }
        self.by_id
            .write()
            .insert(tunneler_id.to_string(), spiffe_id.to_string());
    }

    pub fn list(&self) -> Vec<TunnelerInfo> {
        let mut list: Vec<_> = self
            .by_id
            .read()
            .iter()
            .map(|(id, spiffe)| TunnelerInfo {
                tunneler_id: id.clone(),
                spiffe_id: spiffe.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.tunneler_id.cmp(&b.tunneler_id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_updates_record() {
        let registry = ConnectorRegistry::new();
        registry.record_heartbeat("con-1", "10.0.0.5", "ONLINE");
        let record = registry.get("con-1").unwrap();
        assert_eq!(record.private_ip, "10.0.0.5");
        assert_eq!(record.status, "ONLINE");

        registry.record_heartbeat("con-1", "10.0.0.9", "ONLINE");
        assert_eq!(registry.get("con-1").unwrap().private_ip, "10.0.0.9");
        assert_eq!(registry.list().len(), 1);

        registry.delete("con-1");
        assert!(registry.get("con-1").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn directory_lists_admitted_tunnelers() {
        let directory = TunnelerDirectory::new();
        directory.add("t2", "spiffe://td/tunneler/t2");
        directory.add("t1", "spiffe://td/tunneler/t1");
        directory.add("", "spiffe://td/tunneler/ignored");
        let list = directory.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].tunneler_id, "t1");
    }
}
