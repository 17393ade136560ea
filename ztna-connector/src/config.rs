//! Connector runtime configuration.

use clap::Parser;

/// ZTNA connector: enforces policy at the network edge.
#[derive(Parser, Debug, Clone)]
#[command(name = "ztna-connector")]
pub struct ConnectorConfig {
    /// Controller control-plane address (host:port).
    #[arg(long, env = "CONTROLLER_ADDR")]
    pub controller_addr: String,

    /// Stable identifier of this connector.
    #[arg(long, env = "CONNECTOR_ID")]
    pub connector_id: String,

    /// SPIFFE trust domain shared by the fleet.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "mycorp.internal")]
    pub trust_domain: String,

    /// Listen address for tunneler streams. Defaults to the resolved
    /// private IP on port 9443.
    #[arg(long, env = "CONNECTOR_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Shared HMAC key for verifying policy snapshots.
    #[arg(long, env = "POLICY_SIGNING_KEY")]
    pub policy_signing_key: String,

    /// How long past valid_until a snapshot may still be installed.
    #[arg(long, env = "POLICY_STALE_GRACE_SECONDS", default_value_t = 600)]
    pub policy_stale_grace_seconds: u64,

    /// Single-use enrollment token minted by the controller.
    #[arg(long, env = "ENROLLMENT_TOKEN", default_value = "")]
    pub enrollment_token: String,

    /// Optional PEM file used to verify the controller during enrollment.
    #[arg(long, env = "CONTROLLER_CA_FILE")]
    pub controller_ca_file: Option<String>,

    /// Private IP reported in heartbeats. Resolved automatically when
    /// absent.
    #[arg(long, env = "CONNECTOR_PRIVATE_IP")]
    pub private_ip: Option<String>,
}

/// Derive the local address the OS would use to reach the controller.
pub fn resolve_private_ip(controller_addr: &str) -> anyhow::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(controller_addr)?;
    Ok(socket.local_addr()?.ip().to_string())
}
