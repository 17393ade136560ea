//! Policy compiler.
//!
//! Joins the relational policy data for a connector's remote network into
//! a signed, versioned `PolicySnapshot`. A resource's allowed identities
//! are the distinct non-empty certificate identities reachable through its
//! enabled access rules; disabled rules contribute nothing. No partial
//! snapshots: any lookup error surfaces to the caller unchanged.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::params;

use ztna_proto::snapshot::{
    self, normalize_resource_type, PolicyResource, PolicySnapshot, SnapshotMeta, SnapshotError,
};

use crate::state::db::Db;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("connector_id required")]
    MissingConnectorId,
    #[error("connector {0} has no network")]
    NoNetwork(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Sign(#[from] SnapshotError),
}

/// Compile and sign the snapshot for one connector.
pub fn compile(
    db: &Db,
    connector_id: &str,
    ttl: Duration,
    signing_key: &[u8],
) -> Result<PolicySnapshot, CompileError> {
    if connector_id.is_empty() {
        return Err(CompileError::MissingConnectorId);
    }
    let network_id = db
        .connector_network(connector_id)?
        .ok_or_else(|| CompileError::NoNetwork(connector_id.to_string()))?;
    let resources = policy_resources(db, &network_id)?;

    let now = Utc::now();
    let compiled_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    let valid_until = (now + ttl).to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut snap = PolicySnapshot {
        snapshot_meta: SnapshotMeta {
            connector_id: connector_id.to_string(),
            policy_version: 0,
            compiled_at,
            valid_until,
            signature: String::new(),
        },
        resources,
    };
    snapshot::normalize(&mut snap);

    let hash = snapshot::content_hash(&snap.resources);
    snap.snapshot_meta.policy_version = db.policy_version(connector_id, &hash)?;
    snap.snapshot_meta.signature = snapshot::sign(signing_key, &snap)?;
    Ok(snap)
}

/// Enumerate a network's resources with their allowed identities.
fn policy_resources(db: &Db, network_id: &str) -> Result<Vec<PolicyResource>, rusqlite::Error> {
    let conn = db.conn();
    let mut resource_stmt = conn.prepare(
        "SELECT id, type, address, protocol, port_from, port_to
         FROM resources WHERE remote_network_id = ?1 ORDER BY id ASC",
    )?;
    let mut identity_stmt = conn.prepare(
        "SELECT DISTINCT u.certificate_identity
         FROM access_rules ar
         JOIN access_rule_groups arg ON arg.rule_id = ar.id
         JOIN user_group_members gm ON gm.group_id = arg.group_id
         JOIN users u ON u.id = gm.user_id
         WHERE ar.resource_id = ?1 AND ar.enabled = 1
               AND u.certificate_identity IS NOT NULL
         ORDER BY u.certificate_identity ASC",
    )?;

    let rows = resource_stmt.query_map(params![network_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<u16>>(4)?,
            row.get::<_, Option<u16>>(5)?,
        ))
    })?;

    let mut resources = Vec::new();
    for row in rows {
        let (id, resource_type, address, protocol, port_from, port_to) = row?;

        let identities = identity_stmt
            .query_map(params![id], |row| row.get::<_, Option<String>>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .filter(|identity| !identity.is_empty())
            .collect();

        let mut res = PolicyResource {
            resource_id: id,
            resource_type: normalize_resource_type(&resource_type, &address).to_string(),
            address,
            port: 0,
            protocol: protocol.filter(|p| !p.is_empty()).unwrap_or_else(|| "TCP".to_string()),
            port_from,
            port_to,
            allowed_identities: identities,
        };
        if let Some(from) = res.port_from {
            res.port = from;
        }
        if let Some(to) = res.port_to {
            if res.port == 0 || res.port != to {
                res.port = 0;
            }
        }
        resources.push(res);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::db::ResourceRow;

    const KEY: &[u8] = b"compiler-test-key";
    const TTL: Duration = Duration::from_secs(600);

    /// A network with one resource reachable by one user through an
    /// enabled rule.
    fn seeded_db() -> Db {
        let db = Db::open_memory().unwrap();
        db.save_remote_network("net-1", "office").unwrap();
        db.assign_connector_network("con-1", "net-1").unwrap();

        db.save_user("u1", "Alice", "alice@mycorp.internal", Some("identity-1"))
            .unwrap();
        db.save_group("g1", "engineering").unwrap();
        db.add_group_member("g1", "u1").unwrap();

        db.save_resource(&ResourceRow {
            id: "res-db".into(),
            resource_type: "dns".into(),
            address: "db.internal".into(),
            protocol: Some("TCP".into()),
            port_from: Some(5432),
            port_to: Some(5432),
            remote_network_id: Some("net-1".into()),
        })
        .unwrap();
        db.save_access_rule("rule-1", "allow-db", "res-db", true).unwrap();
        db.add_rule_group("rule-1", "g1").unwrap();
        db
    }

    #[test]
    fn compiles_and_signs() {
        let db = seeded_db();
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        assert_eq!(snap.snapshot_meta.connector_id, "con-1");
        assert_eq!(snap.snapshot_meta.policy_version, 1);
        assert!(snapshot::verify(KEY, &snap));

        assert_eq!(snap.resources.len(), 1);
        let res = &snap.resources[0];
        assert_eq!(res.resource_id, "res-db");
        assert_eq!(res.resource_type, "dns");
        assert_eq!(res.port, 5432);
        assert_eq!(res.allowed_identities, vec!["identity-1"]);
    }

    #[test]
    fn missing_network_is_an_error() {
        let db = Db::open_memory().unwrap();
        assert!(matches!(
            compile(&db, "con-unknown", TTL, KEY),
            Err(CompileError::NoNetwork(_))
        ));
        assert!(matches!(
            compile(&db, "", TTL, KEY),
            Err(CompileError::MissingConnectorId)
        ));
    }

    #[test]
    fn disabled_rules_contribute_nothing() {
        let db = seeded_db();
        db.save_access_rule("rule-1", "allow-db", "res-db", false).unwrap();
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        assert!(snap.resources[0].allowed_identities.is_empty());
    }

    #[test]
    fn users_without_identity_are_skipped() {
        let db = seeded_db();
        db.save_user("u2", "Bob", "bob@mycorp.internal", None).unwrap();
        db.add_group_member("g1", "u2").unwrap();
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        assert_eq!(snap.resources[0].allowed_identities, vec!["identity-1"]);
    }

    #[test]
    fn version_stable_until_content_changes() {
        let db = seeded_db();
        let first = compile(&db, "con-1", TTL, KEY).unwrap();
        let second = compile(&db, "con-1", TTL, KEY).unwrap();
        assert_eq!(first.snapshot_meta.policy_version, 1);
        assert_eq!(second.snapshot_meta.policy_version, 1);

        db.save_user("u2", "Bob", "bob@mycorp.internal", Some("identity-2"))
            .unwrap();
        db.add_group_member("g1", "u2").unwrap();
        let third = compile(&db, "con-1", TTL, KEY).unwrap();
        assert_eq!(third.snapshot_meta.policy_version, 2);
        assert_eq!(
            third.resources[0].allowed_identities,
            vec!["identity-1", "identity-2"]
        );
    }

    #[test]
    fn port_range_collapse() {
        let db = seeded_db();
        db.save_resource(&ResourceRow {
            id: "res-range".into(),
            resource_type: "cidr".into(),
            address: "10.0.10.0/24".into(),
            protocol: None,
            port_from: Some(8000),
            port_to: Some(8100),
            remote_network_id: Some("net-1".into()),
        })
        .unwrap();
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        let res = snap
            .resources
            .iter()
            .find(|r| r.resource_id == "res-range")
            .unwrap();
        // A real range collapses the single port to "any".
        assert_eq!(res.port, 0);
        assert_eq!(res.port_from, Some(8000));
        assert_eq!(res.port_to, Some(8100));
        // Absent protocol defaults to TCP.
        assert_eq!(res.protocol, "TCP");
    }

    #[test]
    fn type_normalization_applies() {
        let db = seeded_db();
        db.save_resource(&ResourceRow {
            id: "res-star".into(),
            resource_type: "".into(),
            address: "*".into(),
            protocol: None,
            port_from: None,
            port_to: None,
            remote_network_id: Some("net-1".into()),
        })
        .unwrap();
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        let res = snap
            .resources
            .iter()
            .find(|r| r.resource_id == "res-star")
            .unwrap();
        assert_eq!(res.resource_type, "internet");
    }

    #[test]
    fn resources_sorted_by_id() {
        let db = seeded_db();
        for id in ["res-z", "res-a"] {
            db.save_resource(&ResourceRow {
                id: id.into(),
                resource_type: "dns".into(),
                address: format!("{id}.internal"),
                protocol: None,
                port_from: None,
                port_to: None,
                remote_network_id: Some("net-1".into()),
            })
            .unwrap();
        }
        let snap = compile(&db, "con-1", TTL, KEY).unwrap();
        let ids: Vec<_> = snap.resources.iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["res-a", "res-db", "res-z"]);
    }
}
