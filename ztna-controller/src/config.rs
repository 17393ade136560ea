//! Controller runtime configuration.

use clap::Parser;

/// ZTNA controller: compiles and distributes authorization policy.
#[derive(Parser, Debug, Clone)]
#[command(name = "ztna-controller")]
pub struct ControllerConfig {
    /// mTLS control-plane listen address.
    #[arg(long, env = "CONTROLLER_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Admin HTTP API listen address.
    #[arg(long, env = "ADMIN_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub admin_addr: String,

    /// SQLite database path.
    #[arg(long, env = "ZTNA_DB_PATH", default_value = "ztna.db")]
    pub db_path: String,

    /// SPIFFE trust domain shared by the fleet.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "mycorp.internal")]
    pub trust_domain: String,

    /// Identifier in this controller's own SPIFFE ID.
    #[arg(long, env = "CONTROLLER_ID", default_value = "controller")]
    pub controller_id: String,

    /// Shared HMAC key for signing policy snapshots.
    #[arg(long, env = "POLICY_SIGNING_KEY")]
    pub policy_signing_key: String,

    /// Snapshot validity window.
    #[arg(long, env = "POLICY_TTL_SECONDS", default_value_t = 900)]
    pub policy_ttl_seconds: u64,

    /// Enrollment token lifetime.
    #[arg(long, env = "ENROLLMENT_TOKEN_TTL_SECONDS", default_value_t = 3600)]
    pub token_ttl_seconds: u64,

    /// Directory holding the CA certificate and key.
    #[arg(long, env = "CA_DIR", default_value = "ca")]
    pub ca_dir: String,

    /// Issued leaf certificate lifetime.
    #[arg(long, env = "CERT_TTL_SECONDS", default_value_t = 86400)]
    pub cert_ttl_seconds: u64,
}
