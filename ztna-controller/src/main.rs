use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ztna_controller::admin;
use ztna_controller::ca::CertificateAuthority;
use ztna_controller::config::ControllerConfig;
use ztna_controller::control_plane::ControlPlane;
use ztna_controller::state::db::Db;
use ztna_controller::state::tokens::TokenStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicit provider selection before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("ZTNA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("ztna_controller=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ControllerConfig::parse();
    let db = Arc::new(Db::open(&config.db_path).context("open database")?);
    let tokens = Arc::new(TokenStore::new(
        db.clone(),
        Duration::from_secs(config.token_ttl_seconds),
    ));
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(
            Path::new(&config.ca_dir),
            &config.trust_domain,
            Duration::from_secs(config.cert_ttl_seconds),
        )
        .context("load certificate authority")?,
    );

    let control_plane = ControlPlane::new(
        config.trust_domain.clone(),
        config.controller_id.clone(),
        config.policy_signing_key.clone().into_bytes(),
        Duration::from_secs(config.policy_ttl_seconds),
        db.clone(),
        tokens,
        ca,
    );

    // Re-seed the in-memory state from the last persisted run.
    let (resources, authorizations) = db.load_acl_state().context("load acl state")?;
    control_plane.acls.load(resources, authorizations);
    for (tunneler_id, spiffe_id) in db.load_admitted_tunnelers().context("load tunnelers")? {
        control_plane.admitted.add(&tunneler_id, &spiffe_id);
    }

    tracing::info!(
        addr = %config.listen_addr,
        admin = %config.admin_addr,
        trust_domain = %config.trust_domain,
        "starting controller"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_listener = tokio::net::TcpListener::bind(&config.admin_addr)
        .await
        .with_context(|| format!("bind {}", config.admin_addr))?;
    let admin_router = admin::router(control_plane.clone());
    let mut admin_shutdown = shutdown_rx.clone();
    let admin_server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = admin_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!("admin server stopped: {e}");
        }
    });

    let control_listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    let serve = tokio::spawn(
        control_plane
            .clone()
            .serve(control_listener, shutdown_rx.clone()),
    );

    // Daily audit retention sweep.
    let prune_db = db.clone();
    let mut prune_shutdown = shutdown_rx;
    let pruner = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = prune_shutdown.changed() => return,
                _ = tick.tick() => {}
            }
            let cutoff = chrono::Utc::now() - chrono::Duration::days(30);
            match prune_db.prune_audit(cutoff) {
                Ok(pruned) if pruned > 0 => tracing::info!(pruned, "pruned audit records"),
                Ok(_) => {}
                Err(e) => tracing::warn!("audit prune failed: {e}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(serve, admin_server, pruner);
    Ok(())
}
