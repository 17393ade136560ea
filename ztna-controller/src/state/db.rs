//! SQLite persistence layer.
//!
//! Holds the relational policy data the compiler reads (users, groups,
//! access rules, resources, networks), the fleet registries, enrollment
//! tokens, per-connector policy version bookkeeping, and the audit log.
//! Uses WAL mode for concurrent reads during writes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use ztna_proto::message::{AclAuthorization, AclResource, DecisionRecord};

use super::registry::{ConnectorRecord, TunnelerRecord};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Mutex<Connection>,
}

/// A resource row as persisted: the delta payload plus its port policy.
#[derive(Debug, Clone, Default)]
pub struct ResourceRow {
    pub id: String,
    pub resource_type: String,
    pub address: String,
    pub protocol: Option<String>,
    pub port_from: Option<u16>,
    pub port_to: Option<u16>,
    pub remote_network_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub hash: String,
    pub expires_at: i64,
    pub used: bool,
    pub connector_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub certificate_identity: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub members: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupMemberRow {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RemoteNetworkRow {
    pub id: String,
    pub name: String,
    pub connectors: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessRuleRow {
    pub id: String,
    pub name: String,
    pub resource_id: String,
    pub enabled: bool,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub principal_spiffe: String,
    pub tunneler_id: String,
    pub resource_id: String,
    pub destination: String,
    pub protocol: String,
    pub port: u16,
    pub decision: String,
    pub reason: String,
    pub connection_id: String,
    pub created_at: i64,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn migrate(&self) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tokens (
                hash         TEXT PRIMARY KEY,
                expires_at   INTEGER NOT NULL,
                used         INTEGER NOT NULL DEFAULT 0,
                connector_id TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                id                   TEXT PRIMARY KEY,
                name                 TEXT NOT NULL,
                email                TEXT NOT NULL UNIQUE,
                certificate_identity TEXT,
                status               TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_certificate_identity
                ON users(certificate_identity);

            CREATE TABLE IF NOT EXISTS user_groups (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_group_members (
                user_id  TEXT NOT NULL,
                group_id TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS remote_networks (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connectors (
                id                TEXT PRIMARY KEY,
                status            TEXT,
                private_ip        TEXT,
                last_seen         INTEGER NOT NULL DEFAULT 0,
                remote_network_id TEXT
            );

            CREATE TABLE IF NOT EXISTS tunnelers (
                id           TEXT PRIMARY KEY,
                spiffe_id    TEXT,
                connector_id TEXT,
                status       TEXT,
                last_seen    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS resources (
                id                TEXT PRIMARY KEY,
                type              TEXT NOT NULL,
                address           TEXT,
                protocol          TEXT NOT NULL DEFAULT 'TCP',
                port_from         INTEGER,
                port_to           INTEGER,
                remote_network_id TEXT
            );

            CREATE TABLE IF NOT EXISTS access_rules (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS access_rule_groups (
                rule_id  TEXT NOT NULL,
                group_id TEXT NOT NULL,
                PRIMARY KEY (rule_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS authorizations (
                principal_spiffe TEXT NOT NULL,
                resource_id      TEXT NOT NULL,
                filters_json     TEXT,
                expires_at       TEXT,
                description      TEXT,
                PRIMARY KEY (principal_spiffe, resource_id)
            );

            CREATE TABLE IF NOT EXISTS connector_policy_versions (
                connector_id TEXT PRIMARY KEY,
                version      INTEGER NOT NULL DEFAULT 0,
                compiled_at  TEXT NOT NULL,
                policy_hash  TEXT
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_spiffe TEXT,
                tunneler_id      TEXT,
                resource_id      TEXT,
                destination      TEXT,
                protocol         TEXT,
                port             INTEGER,
                decision         TEXT,
                reason           TEXT,
                connection_id    TEXT,
                created_at       INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Relational policy data ─────────────────────────────────────────

    pub fn save_user(&self, id: &str, name: &str, email: &str, identity: Option<&str>) -> SqlResult<()> {
        let now = Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO users (id, name, email, certificate_identity, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                email=excluded.email,
                certificate_identity=excluded.certificate_identity,
                updated_at=excluded.updated_at",
            params![id, name, email, identity, now],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        self.conn()
            .query_row(
                "SELECT id, name, email, certificate_identity, status, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
                map_user_row,
            )
            .optional()
    }

    pub fn list_users(&self) -> SqlResult<Vec<UserRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, email, certificate_identity, status, created_at, updated_at
             FROM users ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    pub fn update_user(&self, row: &UserRow) -> SqlResult<()> {
        self.conn().execute(
            "UPDATE users SET name=?2, email=?3, certificate_identity=?4, status=?5, updated_at=?6
             WHERE id=?1",
            params![
                row.id,
                row.name,
                row.email,
                row.certificate_identity,
                row.status,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Delete a user and drop their group memberships.
    pub fn delete_user(&self, id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM user_group_members WHERE user_id = ?1", params![id])?;
        Ok(())
    }

    pub fn save_group(&self, id: &str, name: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO user_groups (id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name",
            params![id, name, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> SqlResult<Option<GroupRow>> {
        self.conn()
            .query_row(
                "SELECT g.id, g.name,
                        (SELECT COUNT(1) FROM user_group_members m WHERE m.group_id = g.id),
                        g.created_at
                 FROM user_groups g WHERE g.id = ?1",
                params![id],
                map_group_row,
            )
            .optional()
    }

    pub fn list_groups(&self) -> SqlResult<Vec<GroupRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name,
                    (SELECT COUNT(1) FROM user_group_members m WHERE m.group_id = g.id),
                    g.created_at
             FROM user_groups g ORDER BY g.name ASC",
        )?;
        let rows = stmt.query_map([], map_group_row)?;
        rows.collect()
    }

    /// Delete a group, its memberships, and its rule links.
    pub fn delete_group(&self, id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM user_groups WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM user_group_members WHERE group_id = ?1", params![id])?;
        conn.execute("DELETE FROM access_rule_groups WHERE group_id = ?1", params![id])?;
        Ok(())
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_group_members (user_id, group_id, added_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, group_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "DELETE FROM user_group_members WHERE user_id = ?1 AND group_id = ?2",
            params![user_id, group_id],
        )?;
        Ok(())
    }

    pub fn list_group_members(&self, group_id: &str) -> SqlResult<Vec<GroupMemberRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.email
             FROM user_group_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?1
             ORDER BY u.name ASC",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(GroupMemberRow {
                user_id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub fn save_remote_network(&self, id: &str, name: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO remote_networks (id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name",
            params![id, name, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_remote_network(&self, id: &str) -> SqlResult<Option<RemoteNetworkRow>> {
        self.conn()
            .query_row(
                "SELECT n.id, n.name,
                        (SELECT COUNT(1) FROM connectors c WHERE c.remote_network_id = n.id),
                        n.created_at
                 FROM remote_networks n WHERE n.id = ?1",
                params![id],
                map_network_row,
            )
            .optional()
    }

    pub fn list_remote_networks(&self) -> SqlResult<Vec<RemoteNetworkRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT n.id, n.name,
                    (SELECT COUNT(1) FROM connectors c WHERE c.remote_network_id = n.id),
                    n.created_at
             FROM remote_networks n ORDER BY n.name ASC",
        )?;
        let rows = stmt.query_map([], map_network_row)?;
        rows.collect()
    }

    /// Delete a network and detach every connector assigned to it.
    pub fn delete_remote_network(&self, id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM remote_networks WHERE id = ?1", params![id])?;
        conn.execute(
            "UPDATE connectors SET remote_network_id = NULL WHERE remote_network_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn assign_connector_network(&self, connector_id: &str, network_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO connectors (id, remote_network_id, last_seen) VALUES (?1, ?2, 0)
             ON CONFLICT(id) DO UPDATE SET remote_network_id=excluded.remote_network_id",
            params![connector_id, network_id],
        )?;
        Ok(())
    }

    pub fn remove_connector_network(&self, connector_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "UPDATE connectors SET remote_network_id = NULL WHERE id = ?1",
            params![connector_id],
        )?;
        Ok(())
    }

    pub fn list_network_connectors(&self, network_id: &str) -> SqlResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM connectors WHERE remote_network_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![network_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Delete a connector's registry row along with its network
    /// assignment and version bookkeeping.
    pub fn delete_connector(&self, connector_id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM connectors WHERE id = ?1", params![connector_id])?;
        conn.execute(
            "DELETE FROM connector_policy_versions WHERE connector_id = ?1",
            params![connector_id],
        )?;
        Ok(())
    }

    pub fn connector_network(&self, connector_id: &str) -> SqlResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT remote_network_id FROM connectors WHERE id = ?1",
                params![connector_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|row| row.flatten().filter(|id| !id.trim().is_empty()))
    }

    pub fn save_access_rule(&self, id: &str, name: &str, resource_id: &str, enabled: bool) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO access_rules (id, name, resource_id, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                resource_id=excluded.resource_id,
                enabled=excluded.enabled",
            params![id, name, resource_id, enabled as i32, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_access_rule(&self, id: &str) -> SqlResult<Option<AccessRuleRow>> {
        let conn = self.conn();
        let rule = conn
            .query_row(
                "SELECT id, name, resource_id, enabled FROM access_rules WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AccessRuleRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        resource_id: row.get(2)?,
                        enabled: row.get::<_, i32>(3)? != 0,
                        group_ids: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut rule) = rule else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT group_id FROM access_rule_groups WHERE rule_id = ?1 ORDER BY group_id ASC",
        )?;
        rule.group_ids = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(Some(rule))
    }

    pub fn list_access_rules(&self) -> SqlResult<Vec<AccessRuleRow>> {
        let conn = self.conn();
        let mut rule_stmt = conn.prepare(
            "SELECT id, name, resource_id, enabled FROM access_rules ORDER BY id ASC",
        )?;
        let mut group_stmt = conn.prepare(
            "SELECT group_id FROM access_rule_groups WHERE rule_id = ?1 ORDER BY group_id ASC",
        )?;
        let rules = rule_stmt.query_map([], |row| {
            Ok(AccessRuleRow {
                id: row.get(0)?,
                name: row.get(1)?,
                resource_id: row.get(2)?,
                enabled: row.get::<_, i32>(3)? != 0,
                group_ids: Vec::new(),
            })
        })?;
        let mut out = Vec::new();
        for rule in rules {
            let mut rule = rule?;
            rule.group_ids = group_stmt
                .query_map(params![rule.id], |row| row.get(0))?
                .collect::<SqlResult<Vec<String>>>()?;
            out.push(rule);
        }
        Ok(out)
    }

    /// Delete a rule and its group links.
    pub fn delete_access_rule(&self, id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM access_rules WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM access_rule_groups WHERE rule_id = ?1", params![id])?;
        Ok(())
    }

    pub fn add_rule_group(&self, rule_id: &str, group_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO access_rule_groups (rule_id, group_id) VALUES (?1, ?2)",
            params![rule_id, group_id],
        )?;
        Ok(())
    }

    pub fn remove_rule_group(&self, rule_id: &str, group_id: &str) -> SqlResult<()> {
        self.conn().execute(
            "DELETE FROM access_rule_groups WHERE rule_id = ?1 AND group_id = ?2",
            params![rule_id, group_id],
        )?;
        Ok(())
    }

    // ── Resources & authorizations ─────────────────────────────────────

    pub fn save_resource(&self, row: &ResourceRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO resources (id, type, address, protocol, port_from, port_to, remote_network_id)
             VALUES (?1, ?2, ?3, COALESCE(?4, 'TCP'), ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                type=excluded.type,
                address=excluded.address,
                protocol=excluded.protocol,
                port_from=excluded.port_from,
                port_to=excluded.port_to,
                remote_network_id=excluded.remote_network_id",
            params![
                row.id,
                row.resource_type,
                row.address,
                row.protocol,
                row.port_from,
                row.port_to,
                row.remote_network_id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_resource(&self, id: &str) -> SqlResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM resources WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM authorizations WHERE resource_id = ?1", params![id])?;
        Ok(())
    }

    pub fn save_authorization(&self, auth: &AclAuthorization) -> SqlResult<()> {
        let filters_json = serde_json::to_string(&auth.filters).unwrap_or_else(|_| "[]".to_string());
        self.conn().execute(
            "INSERT INTO authorizations (principal_spiffe, resource_id, filters_json, expires_at, description)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(principal_spiffe, resource_id) DO UPDATE SET
                filters_json=excluded.filters_json,
                expires_at=excluded.expires_at,
                description=excluded.description",
            params![
                auth.principal_spiffe,
                auth.resource_id,
                filters_json,
                auth.expires_at,
                auth.description,
            ],
        )?;
        Ok(())
    }

    pub fn delete_authorization(&self, resource_id: &str, principal_spiffe: &str) -> SqlResult<()> {
        self.conn().execute(
            "DELETE FROM authorizations WHERE resource_id = ?1 AND principal_spiffe = ?2",
            params![resource_id, principal_spiffe],
        )?;
        Ok(())
    }

    /// Load all persisted resources and authorization edges.
    pub fn load_acl_state(&self) -> SqlResult<(Vec<AclResource>, Vec<AclAuthorization>)> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, type, address, remote_network_id FROM resources")?;
        let resources = stmt
            .query_map([], |row| {
                Ok(AclResource {
                    id: row.get(0)?,
                    resource_type: row.get(1)?,
                    address: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    remote_network_id: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT principal_spiffe, resource_id, filters_json, expires_at, description
             FROM authorizations",
        )?;
        let authorizations = stmt
            .query_map([], |row| {
                let filters_json: Option<String> = row.get(2)?;
                let filters = filters_json
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default();
                Ok(AclAuthorization {
                    principal_spiffe: row.get(0)?,
                    resource_id: row.get(1)?,
                    filters,
                    expires_at: row.get(3)?,
                    description: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok((resources, authorizations))
    }

    // ── Policy version bookkeeping ─────────────────────────────────────

    /// Monotonic per-connector version: bumped iff the content hash
    /// changed, starting at 1. Persists the updated triplet.
    pub fn policy_version(&self, connector_id: &str, policy_hash: &str) -> SqlResult<i64> {
        let conn = self.conn();
        let previous: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT version, policy_hash FROM connector_policy_versions WHERE connector_id = ?1",
                params![connector_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let version = match previous {
            Some((version, Some(prev_hash))) if version > 0 && prev_hash == policy_hash => version,
            Some((version, _)) => version + 1,
            None => 1,
        };
        let compiled_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        conn.execute(
            "INSERT INTO connector_policy_versions (connector_id, version, compiled_at, policy_hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(connector_id) DO UPDATE SET
                version=excluded.version,
                compiled_at=excluded.compiled_at,
                policy_hash=excluded.policy_hash",
            params![connector_id, version, compiled_at, policy_hash],
        )?;
        Ok(version)
    }

    // ── Registries ─────────────────────────────────────────────────────

    pub fn save_connector(&self, rec: &ConnectorRecord) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO connectors (id, status, private_ip, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                status=excluded.status,
                private_ip=excluded.private_ip,
                last_seen=excluded.last_seen",
            params![
                rec.connector_id,
                rec.status,
                rec.private_ip,
                rec.last_seen.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Tunnelers admitted in a previous run, for re-seeding the directory.
    pub fn load_admitted_tunnelers(&self) -> SqlResult<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, spiffe_id FROM tunnelers WHERE spiffe_id IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    pub fn save_tunneler(&self, rec: &TunnelerRecord) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO tunnelers (id, spiffe_id, connector_id, status, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                spiffe_id=excluded.spiffe_id,
                connector_id=excluded.connector_id,
                status=excluded.status,
                last_seen=excluded.last_seen",
            params![
                rec.tunneler_id,
                rec.spiffe_id,
                rec.connector_id,
                rec.status,
                rec.last_seen.timestamp(),
            ],
        )?;
        Ok(())
    }

    // ── Tokens ─────────────────────────────────────────────────────────

    pub fn save_token(&self, row: &TokenRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO tokens (hash, expires_at, used, connector_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(hash) DO UPDATE SET
                expires_at=excluded.expires_at,
                used=excluded.used,
                connector_id=excluded.connector_id",
            params![row.hash, row.expires_at, row.used as i32, row.connector_id],
        )?;
        Ok(())
    }

    /// Drop every token bound to (or consumed by) a connector.
    pub fn delete_tokens_for_connector(&self, connector_id: &str) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM tokens WHERE connector_id = ?1",
            params![connector_id],
        )
    }

    pub fn token(&self, hash: &str) -> SqlResult<Option<TokenRow>> {
        self.conn()
            .query_row(
                "SELECT hash, expires_at, used, connector_id FROM tokens WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok(TokenRow {
                        hash: row.get(0)?,
                        expires_at: row.get(1)?,
                        used: row.get::<_, i32>(2)? != 0,
                        connector_id: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    // ── Audit log ──────────────────────────────────────────────────────

    pub fn append_audit(&self, record: &DecisionRecord) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO audit_logs (principal_spiffe, tunneler_id, resource_id, destination,
                                     protocol, port, decision, reason, connection_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.spiffe_id,
                record.tunneler_id,
                record.resource_id,
                record.destination,
                record.protocol,
                record.port,
                record.decision,
                record.reason,
                record.connection_id,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn list_audit(&self, limit: usize) -> SqlResult<Vec<AuditRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, principal_spiffe, tunneler_id, resource_id, destination, protocol,
                    port, decision, reason, connection_id, created_at
             FROM audit_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AuditRow {
                id: row.get(0)?,
                principal_spiffe: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                tunneler_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                resource_id: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                destination: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                protocol: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                port: row.get::<_, Option<u16>>(6)?.unwrap_or_default(),
                decision: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                reason: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                connection_id: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                created_at: row.get(10)?,
            })
        })?;
        rows.collect()
    }

    pub fn prune_audit(&self, older_than: DateTime<Utc>) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM audit_logs WHERE created_at < ?1",
            params![older_than.timestamp()],
        )
    }
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        certificate_identity: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_group_row(row: &rusqlite::Row) -> SqlResult<GroupRow> {
    Ok(GroupRow {
        id: row.get(0)?,
        name: row.get(1)?,
        members: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_network_row(row: &rusqlite::Row) -> SqlResult<RemoteNetworkRow> {
    Ok(RemoteNetworkRow {
        id: row.get(0)?,
        name: row.get(1)?,
        connectors: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reason: &str) -> DecisionRecord {
        DecisionRecord {
            tunneler_id: "t1".into(),
            spiffe_id: "spiffe://td/tunneler/t1".into(),
            resource_id: "res-1".into(),
            destination: "db.internal".into(),
            protocol: "TCP".into(),
            port: 5432,
            decision: "deny".into(),
            reason: reason.into(),
            connector_id: "con-1".into(),
            connection_id: "conn-1".into(),
        }
    }

    #[test]
    fn connector_network_lookup() {
        let db = Db::open_memory().unwrap();
        assert!(db.connector_network("con-1").unwrap().is_none());

        db.save_remote_network("net-1", "office").unwrap();
        db.assign_connector_network("con-1", "net-1").unwrap();
        assert_eq!(db.connector_network("con-1").unwrap().as_deref(), Some("net-1"));
    }

    #[test]
    fn policy_version_monotonic_per_hash() {
        let db = Db::open_memory().unwrap();
        assert_eq!(db.policy_version("con-1", "hash-a").unwrap(), 1);
        assert_eq!(db.policy_version("con-1", "hash-a").unwrap(), 1);
        assert_eq!(db.policy_version("con-1", "hash-b").unwrap(), 2);
        assert_eq!(db.policy_version("con-1", "hash-b").unwrap(), 2);
        // Versions are tracked per connector.
        assert_eq!(db.policy_version("con-2", "hash-b").unwrap(), 1);
    }

    #[test]
    fn acl_state_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.save_resource(&ResourceRow {
            id: "res-1".into(),
            resource_type: "dns".into(),
            address: "db.internal".into(),
            ..Default::default()
        })
        .unwrap();
        db.save_authorization(&AclAuthorization {
            principal_spiffe: "identity-1".into(),
            resource_id: "res-1".into(),
            filters: Vec::new(),
            expires_at: None,
            description: None,
        })
        .unwrap();

        let (resources, authorizations) = db.load_acl_state().unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id, "res-1");
        assert_eq!(authorizations.len(), 1);

        db.delete_resource("res-1").unwrap();
        let (resources, authorizations) = db.load_acl_state().unwrap();
        assert!(resources.is_empty());
        // Deleting a resource cascades to its authorizations.
        assert!(authorizations.is_empty());
    }

    #[test]
    fn audit_roundtrip_and_prune() {
        let db = Db::open_memory().unwrap();
        db.append_audit(&record("not_allowed")).unwrap();
        db.append_audit(&record("allowed")).unwrap();

        let rows = db.list_audit(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reason, "allowed"); // newest first

        let pruned = db.prune_audit(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(pruned, 2);
        assert!(db.list_audit(10).unwrap().is_empty());
    }

    #[test]
    fn user_crud_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.save_user("u1", "Alice", "alice@mycorp.internal", Some("identity-1"))
            .unwrap();
        db.save_user("u2", "Bob", "bob@mycorp.internal", None).unwrap();
        db.save_group("g1", "engineering").unwrap();
        db.add_group_member("g1", "u1").unwrap();

        assert_eq!(db.list_users().unwrap().len(), 2);
        let mut user = db.get_user("u1").unwrap().unwrap();
        assert_eq!(user.email, "alice@mycorp.internal");
        assert_eq!(user.status, "ACTIVE");

        user.name = "Alice B".into();
        user.status = "SUSPENDED".into();
        db.update_user(&user).unwrap();
        let updated = db.get_user("u1").unwrap().unwrap();
        assert_eq!(updated.name, "Alice B");
        assert_eq!(updated.status, "SUSPENDED");
        assert_eq!(updated.created_at, user.created_at);

        db.delete_user("u1").unwrap();
        assert!(db.get_user("u1").unwrap().is_none());
        // Membership rows go with the user.
        assert!(db.list_group_members("g1").unwrap().is_empty());
    }

    #[test]
    fn group_membership_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.save_group("g1", "engineering").unwrap();
        db.save_user("u1", "Alice", "alice@mycorp.internal", None).unwrap();
        db.save_user("u2", "Bob", "bob@mycorp.internal", None).unwrap();
        db.add_group_member("g1", "u1").unwrap();
        db.add_group_member("g1", "u2").unwrap();

        let groups = db.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, 2);
        assert_eq!(db.get_group("g1").unwrap().unwrap().members, 2);

        let members = db.list_group_members("g1").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "Alice");

        db.remove_group_member("g1", "u1").unwrap();
        assert_eq!(db.list_group_members("g1").unwrap().len(), 1);
    }

    #[test]
    fn group_delete_cascades_members_and_rule_links() {
        let db = Db::open_memory().unwrap();
        db.save_group("g1", "engineering").unwrap();
        db.save_user("u1", "Alice", "alice@mycorp.internal", None).unwrap();
        db.add_group_member("g1", "u1").unwrap();
        db.save_access_rule("rule-1", "allow", "res-1", true).unwrap();
        db.add_rule_group("rule-1", "g1").unwrap();

        db.delete_group("g1").unwrap();
        assert!(db.get_group("g1").unwrap().is_none());
        assert!(db.list_group_members("g1").unwrap().is_empty());
        let rule = db.get_access_rule("rule-1").unwrap().unwrap();
        assert!(rule.group_ids.is_empty());
    }

    #[test]
    fn network_crud_and_connector_assignment() {
        let db = Db::open_memory().unwrap();
        db.save_remote_network("net-1", "office").unwrap();
        db.save_remote_network("net-2", "datacenter").unwrap();
        db.assign_connector_network("con-1", "net-1").unwrap();
        db.assign_connector_network("con-2", "net-1").unwrap();

        let networks = db.list_remote_networks().unwrap();
        assert_eq!(networks.len(), 2);
        let net1 = db.get_remote_network("net-1").unwrap().unwrap();
        assert_eq!(net1.connectors, 2);
        assert_eq!(
            db.list_network_connectors("net-1").unwrap(),
            vec!["con-1", "con-2"]
        );

        db.remove_connector_network("con-1").unwrap();
        assert!(db.connector_network("con-1").unwrap().is_none());

        // Deleting a network detaches the remaining connector.
        db.delete_remote_network("net-1").unwrap();
        assert!(db.get_remote_network("net-1").unwrap().is_none());
        assert!(db.connector_network("con-2").unwrap().is_none());
    }

    #[test]
    fn access_rule_crud_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.save_access_rule("rule-1", "allow-db", "res-1", true).unwrap();
        db.add_rule_group("rule-1", "g1").unwrap();
        db.add_rule_group("rule-1", "g2").unwrap();

        let rules = db.list_access_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].group_ids, vec!["g1", "g2"]);

        // Disable via the upsert path.
        db.save_access_rule("rule-1", "allow-db", "res-1", false).unwrap();
        let rule = db.get_access_rule("rule-1").unwrap().unwrap();
        assert!(!rule.enabled);

        db.remove_rule_group("rule-1", "g1").unwrap();
        let rule = db.get_access_rule("rule-1").unwrap().unwrap();
        assert_eq!(rule.group_ids, vec!["g2"]);

        db.delete_access_rule("rule-1").unwrap();
        assert!(db.get_access_rule("rule-1").unwrap().is_none());
    }

    #[test]
    fn connector_delete_cascades() {
        let db = Db::open_memory().unwrap();
        db.save_remote_network("net-1", "office").unwrap();
        db.assign_connector_network("con-1", "net-1").unwrap();
        db.policy_version("con-1", "hash-a").unwrap();
        db.save_token(&TokenRow {
            hash: "tok-hash".into(),
            expires_at: i64::MAX,
            used: true,
            connector_id: Some("con-1".into()),
        })
        .unwrap();

        db.delete_connector("con-1").unwrap();
        assert!(db.connector_network("con-1").unwrap().is_none());
        // Version bookkeeping restarts from scratch on re-enrollment.
        assert_eq!(db.policy_version("con-1", "hash-a").unwrap(), 1);

        assert_eq!(db.delete_tokens_for_connector("con-1").unwrap(), 1);
        assert!(db.token("tok-hash").unwrap().is_none());
    }

    #[test]
    fn token_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.save_token(&TokenRow {
            hash: "abc".into(),
            expires_at: 1234,
            used: false,
            connector_id: None,
        })
        .unwrap();
        let row = db.token("abc").unwrap().unwrap();
        assert!(!row.used);

        db.save_token(&TokenRow {
            hash: "abc".into(),
            expires_at: 1234,
            used: true,
            connector_id: Some("con-1".into()),
        })
        .unwrap();
        let row = db.token("abc").unwrap().unwrap();
        assert!(row.used);
        assert_eq!(row.connector_id.as_deref(), Some("con-1"));
        assert!(db.token("missing").unwrap().is_none());
    }
}
