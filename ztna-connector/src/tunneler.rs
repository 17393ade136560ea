//! Tunneler-facing control handler.
//!
//! A dedicated mTLS server accepts streams from tunnelers whose SPIFFE ID
//! is present in the local allowlist. Each admission request is evaluated
//! against the policy cache; the decision goes back to the tunneler on the
//! same stream and upstream to the controller for audit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use ztna_proto::identity;
use ztna_proto::message::{
    self, ControlMessage, DecisionRecord, ErrorInfo, TunnelerStatus,
};
use ztna_proto::spiffe::Role;

use crate::allowlist::TunnelerAllowlist;
use crate::cache::{reason, PolicyCache};
use crate::certstore::CertStore;
use crate::tls;

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct TunnelerServerParams {
    pub listen_addr: String,
    pub trust_domain: String,
    pub connector_id: String,
}

/// Supervisor: keep the tunneler server alive, restarting with backoff.
pub async fn server_loop(
    params: TunnelerServerParams,
    store: Arc<CertStore>,
    ca_pem: Vec<u8>,
    allowlist: Arc<TunnelerAllowlist>,
    cache: Arc<PolicyCache>,
    upstream_tx: mpsc::Sender<ControlMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RESTART_BACKOFF_INITIAL;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let shutdown_for_server = shutdown.clone();
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            result = run_server(
                &params,
                &store,
                &ca_pem,
                &allowlist,
                &cache,
                &upstream_tx,
                shutdown_for_server,
            ) => result,
        };
        if let Err(e) = result {
            warn!("tunneler server stopped: {e:#}");
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
    }
}

async fn run_server(
    params: &TunnelerServerParams,
    store: &Arc<CertStore>,
    ca_pem: &[u8],
    allowlist: &Arc<TunnelerAllowlist>,
    cache: &Arc<PolicyCache>,
    upstream_tx: &mpsc::Sender<ControlMessage>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&params.listen_addr)
        .await
        .with_context(|| format!("bind {}", params.listen_addr))?;
    serve_listener(params, store, ca_pem, allowlist, cache, upstream_tx, shutdown, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_listener(
    params: &TunnelerServerParams,
    store: &Arc<CertStore>,
    ca_pem: &[u8],
    allowlist: &Arc<TunnelerAllowlist>,
    cache: &Arc<PolicyCache>,
    upstream_tx: &mpsc::Sender<ControlMessage>,
    shutdown: watch::Receiver<bool>,
    listener: TcpListener,
) -> Result<()> {
    let config = tls::mtls_server_config(store.clone(), ca_pem)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "tunneler server listening");
    }

    loop {
        let (tcp, peer_addr) = listener.accept().await.context("accept")?;
        let acceptor = acceptor.clone();
        let allowlist = allowlist.clone();
        let cache = cache.clone();
        let upstream_tx = upstream_tx.clone();
        let trust_domain = params.trust_domain.clone();
        let connector_id = params.connector_id.clone();
        let mut conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let handle = handle_connection(
                tcp,
                acceptor,
                &trust_domain,
                &connector_id,
                &allowlist,
                &cache,
                &upstream_tx,
            );
            tokio::select! {
                _ = conn_shutdown.changed() => {}
                result = handle => {
                    if let Err(e) = result {
                        warn!(peer = %peer_addr, "tunneler stream ended: {e:#}");
                    }
                }
            }
        });
    }
}

async fn handle_connection(
    tcp: TcpStream,
    acceptor: TlsAcceptor,
    trust_domain: &str,
    connector_id: &str,
    allowlist: &TunnelerAllowlist,
    cache: &PolicyCache,
    upstream_tx: &mpsc::Sender<ControlMessage>,
) -> Result<()> {
    let stream = acceptor.accept(tcp).await.context("tls handshake")?;
    let peer = {
        let (_, conn) = stream.get_ref();
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| anyhow!("tunneler presented no certificate"))?;
        identity::peer_identity(certs)?
    };
    let spiffe_id = peer.to_string();
    let (read_half, mut write_half) = tokio::io::split(stream);

    if peer.role != Role::Tunneler
        || peer.trust_domain != trust_domain
        || !allowlist.contains(&spiffe_id)
    {
        let denial = ControlMessage::Error {
            payload: ErrorInfo {
                code: "permission_denied".to_string(),
                message: "tunneler not admitted".to_string(),
            },
        };
        let _ = message::write_frame(&mut write_half, &denial).await;
        return Err(anyhow!("rejected tunneler {spiffe_id}"));
    }

    let tunneler_id = peer.id.clone();
    let connection_id = format!("conn-{}", Utc::now().timestamp_micros());
    info!(%spiffe_id, %connection_id, "tunneler connected");

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        // Two-phase decode: a frame that is recognizably a tunneler_request
        // with a bad payload still gets an audited invalid_request denial
        // instead of being dropped on the floor.
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!(%spiffe_id, "undecodable tunneler frame: {e}");
                continue;
            }
        };
        let msg = match serde_json::from_value::<ControlMessage>(value.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                if value.get("type").and_then(|t| t.as_str()) == Some("tunneler_request") {
                    emit_decision(
                        &mut write_half,
                        upstream_tx,
                        DecisionRecord {
                            tunneler_id: tunneler_id.clone(),
                            spiffe_id: spiffe_id.clone(),
                            resource_id: String::new(),
                            destination: String::new(),
                            protocol: String::new(),
                            port: 0,
                            decision: "deny".to_string(),
                            reason: reason::INVALID_REQUEST.to_string(),
                            connector_id: connector_id.to_string(),
                            connection_id: connection_id.clone(),
                        },
                    )
                    .await?;
                } else {
                    warn!(%spiffe_id, "invalid tunneler frame: {e}");
                }
                continue;
            }
        };

        match msg {
            ControlMessage::Ping => {
                message::write_frame(&mut write_half, &ControlMessage::Pong).await?;
            }
            ControlMessage::TunnelerHeartbeat { payload } => {
                let enriched = ControlMessage::TunnelerHeartbeat {
                    payload: TunnelerStatus {
                        tunneler_id: tunneler_id.clone(),
                        spiffe_id: spiffe_id.clone(),
                        status: payload.status,
                        connector_id: connector_id.to_string(),
                    },
                };
                if upstream_tx.send(enriched).await.is_err() {
                    warn!("upstream channel closed, dropping tunneler heartbeat");
                }
            }
            ControlMessage::TunnelerRequest { payload } => {
                let decision = cache.allowed(
                    &spiffe_id,
                    &payload.destination,
                    &payload.protocol,
                    payload.port,
                );
                emit_decision(
                    &mut write_half,
                    upstream_tx,
                    DecisionRecord {
                        tunneler_id: tunneler_id.clone(),
                        spiffe_id: spiffe_id.clone(),
                        resource_id: decision.resource_id,
                        destination: payload.destination,
                        protocol: payload.protocol,
                        port: payload.port,
                        decision: if decision.allowed { "allow" } else { "deny" }.to_string(),
                        reason: decision.reason.to_string(),
                        connector_id: connector_id.to_string(),
                        connection_id: connection_id.clone(),
                    },
                )
                .await?;
            }
            other => warn!(%spiffe_id, "unexpected tunneler message: {other:?}"),
        }
    }
    Ok(())
}

/// Send the decision back to the tunneler and upstream for audit.
async fn emit_decision<W>(
    writer: &mut W,
    upstream_tx: &mpsc::Sender<ControlMessage>,
    record: DecisionRecord,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!(
        principal = %record.spiffe_id,
        resource_id = %record.resource_id,
        dest = %record.destination,
        protocol = %record.protocol,
        port = record.port,
        decision = %record.decision,
        reason = %record.reason,
        "acl decision"
    );
    message::write_frame(
        writer,
        &ControlMessage::TunnelerDecision {
            payload: record.clone(),
        },
    )
    .await?;
    if upstream_tx
        .send(ControlMessage::AclDecision { payload: record })
        .await
        .is_err()
    {
        warn!("upstream channel closed, dropping audit record");
    }
    Ok(())
}
