use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use ztna_connector::allowlist::TunnelerAllowlist;
use ztna_connector::cache::PolicyCache;
use ztna_connector::certstore::CertStore;
use ztna_connector::config::{resolve_private_ip, ConnectorConfig};
use ztna_connector::session::{control_plane_loop, SessionParams};
use ztna_connector::tunneler::{server_loop, TunnelerServerParams};
use ztna_connector::{enroll, renewal};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicit provider selection before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("ZTNA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("ztna_connector=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ConnectorConfig::parse();
    let private_ip = match config.private_ip.clone() {
        Some(ip) => ip,
        None => resolve_private_ip(&config.controller_addr)
            .context("resolve private IP toward controller")?,
    };
    let listen_addr = config
        .listen_addr
        .clone()
        .unwrap_or_else(|| format!("{private_ip}:9443"));

    let controller_ca = match &config.controller_ca_file {
        Some(path) => Some(std::fs::read(path).with_context(|| format!("read {path}"))?),
        None => None,
    };
    let enrollment = enroll::enroll(
        &config.controller_addr,
        &config.connector_id,
        &config.enrollment_token,
        controller_ca.as_deref(),
    )
    .await
    .context("enrollment")?;

    let chain = ztna_proto::identity::certs_from_pem(enrollment.cert_pem.as_bytes())
        .context("parse enrolled certificate")?;
    let store = CertStore::new(
        chain,
        enrollment.private_key(),
        enrollment.not_before,
        enrollment.not_after,
    )
    .context("initialize certificate store")?;
    let ca_pem = enrollment.ca_pem.into_bytes();

    let allowlist = Arc::new(TunnelerAllowlist::new());
    let cache = Arc::new(PolicyCache::new(
        config.policy_signing_key.clone().into_bytes(),
        Duration::from_secs(config.policy_stale_grace_seconds),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (upstream_tx, upstream_rx) = mpsc::channel(16);
    let (_reload_tx, reload_rx) = mpsc::channel(1);

    let session = tokio::spawn(control_plane_loop(
        SessionParams {
            controller_addr: config.controller_addr.clone(),
            trust_domain: config.trust_domain.clone(),
            connector_id: config.connector_id.clone(),
            private_ip,
        },
        store.clone(),
        ca_pem.clone(),
        allowlist.clone(),
        cache.clone(),
        upstream_rx,
        reload_rx,
        shutdown_rx.clone(),
    ));

    let renewer = tokio::spawn(renewal::renewal_loop(
        config.controller_addr.clone(),
        config.connector_id.clone(),
        store.clone(),
        ca_pem.clone(),
        shutdown_rx.clone(),
    ));

    let tunneler_server = tokio::spawn(server_loop(
        TunnelerServerParams {
            listen_addr,
            trust_domain: config.trust_domain.clone(),
            connector_id: config.connector_id.clone(),
        },
        store,
        ca_pem,
        allowlist,
        cache,
        upstream_tx,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(session, renewer, tunneler_server);
    Ok(())
}
