//! Control-plane session supervisor.
//!
//! Dials the controller over mTLS, verifies the peer really is the
//! controller for our trust domain, and then multiplexes one bidirectional
//! stream: inbound policy/allowlist updates, outbound heartbeats and audit
//! frames from the tunneler handler, and a reload trigger that forces a
//! fresh handshake. Any error tears the session down and the supervisor
//! redials with exponential backoff (2 s doubling to a 30 s cap; the
//! backoff is not reset on success).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use ztna_proto::identity;
use ztna_proto::message::{self, ControlMessage};
use ztna_proto::spiffe::Role;

use crate::allowlist::TunnelerAllowlist;
use crate::cache::PolicyCache;
use crate::certstore::CertStore;
use crate::tls;

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
/// Keepalive time + timeout: no inbound frame for this long ends the
/// session.
const IDLE_TIMEOUT: Duration = Duration::from_secs(40);

pub struct SessionParams {
    pub controller_addr: String,
    pub trust_domain: String,
    pub connector_id: String,
    pub private_ip: String,
}

/// Supervisor: redial forever until shutdown.
pub async fn control_plane_loop(
    params: SessionParams,
    store: Arc<CertStore>,
    ca_pem: Vec<u8>,
    allowlist: Arc<TunnelerAllowlist>,
    cache: Arc<PolicyCache>,
    mut outbound_rx: mpsc::Receiver<ControlMessage>,
    mut reload_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            result = run_session(
                &params,
                &store,
                &ca_pem,
                &allowlist,
                &cache,
                &mut outbound_rx,
                &mut reload_rx,
            ) => result,
        };
        match result {
            Ok(()) => info!("control-plane session closed"),
            Err(e) => warn!("control-plane connection ended: {e:#}"),
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// One session: dial, hello, fan-in loop until error or reload.
async fn run_session(
    params: &SessionParams,
    store: &Arc<CertStore>,
    ca_pem: &[u8],
    allowlist: &Arc<TunnelerAllowlist>,
    cache: &Arc<PolicyCache>,
    outbound_rx: &mut mpsc::Receiver<ControlMessage>,
    reload_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    let tcp = TcpStream::connect(&params.controller_addr)
        .await
        .with_context(|| format!("connect {}", params.controller_addr))?;
    let config = tls::mtls_client_config(store.clone(), ca_pem)?;
    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector
        .connect(tls::server_name(&params.controller_addr)?, tcp)
        .await
        .context("tls handshake")?;

    // The chain already verified against the pinned CA; bind it to the
    // controller role in our trust domain before trusting any frame.
    {
        let (_, conn) = stream.get_ref();
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| anyhow!("controller presented no certificate"))?;
        let peer = identity::peer_identity(certs)?;
        if peer.role != Role::Controller || peer.trust_domain != params.trust_domain {
            bail!("unexpected controller identity: {peer}");
        }
        debug!(peer = %peer, "control-plane stream established");
    }

    let (read_half, mut write_half) = tokio::io::split(stream);
    message::write_frame(&mut write_half, &ControlMessage::ConnectorHello).await?;

    // Reader task feeds a channel so the main loop can select over
    // everything at once.
    let (recv_tx, mut recv_rx) = mpsc::channel::<Result<ControlMessage>>(16);
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(msg) => {
                        if recv_tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("invalid control frame: {e}"),
                },
                Ok(None) => {
                    let _ = recv_tx.send(Err(anyhow!("stream closed by controller"))).await;
                    break;
                }
                Err(e) => {
                    let _ = recv_tx.send(Err(anyhow!("stream read error: {e}"))).await;
                    break;
                }
            }
        }
    });

    let mut heartbeat = interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    let result = loop {
        tokio::select! {
            inbound = recv_rx.recv() => {
                match inbound {
                    Some(Ok(msg)) => {
                        last_inbound = Instant::now();
                        if let Some(reply) = handle_message(msg, allowlist, cache) {
                            if let Err(e) = message::write_frame(&mut write_half, &reply).await {
                                break Err(anyhow!("stream write error: {e}"));
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(anyhow!("reader task stopped")),
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = message::write_frame(&mut write_half, &msg).await {
                            break Err(anyhow!("stream write error: {e}"));
                        }
                    }
                    None => break Err(anyhow!("outbound channel closed")),
                }
            }
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() > IDLE_TIMEOUT {
                    break Err(anyhow!("controller unresponsive for {IDLE_TIMEOUT:?}"));
                }
                let hb = ControlMessage::Heartbeat {
                    connector_id: params.connector_id.clone(),
                    private_ip: params.private_ip.clone(),
                    status: "ONLINE".to_string(),
                };
                if let Err(e) = message::write_frame(&mut write_half, &hb).await {
                    break Err(anyhow!("stream write error: {e}"));
                }
            }
            reload = reload_rx.recv() => {
                match reload {
                    Some(()) => {
                        info!("reload requested, cycling control-plane session");
                        break Ok(());
                    }
                    None => break Err(anyhow!("reload channel closed")),
                }
            }
        }
    };
    reader.abort();
    result
}

/// Apply one inbound control message; return an optional reply frame.
fn handle_message(
    msg: ControlMessage,
    allowlist: &TunnelerAllowlist,
    cache: &PolicyCache,
) -> Option<ControlMessage> {
    match msg {
        ControlMessage::Ping => return Some(ControlMessage::Pong),
        ControlMessage::Pong => {}
        ControlMessage::TunnelerAllowlist { payload } => {
            allowlist.replace(&payload);
            debug!(tunnelers = payload.len(), "tunneler allowlist replaced");
        }
        ControlMessage::TunnelerAllow { payload } => {
            allowlist.add(&payload.spiffe_id);
        }
        ControlMessage::AclInit { payload } => {
            let version = payload.snapshot_meta.policy_version;
            if cache.replace(payload) {
                info!(version, "policy snapshot applied");
            } else {
                warn!(version, "policy snapshot rejected");
            }
        }
        ControlMessage::ResourceUpdated { payload } => cache.upsert_resource(payload),
        ControlMessage::ResourceRemoved { payload } => cache.remove_resource(&payload.resource_id),
        ControlMessage::AuthorizationUpdated { payload } => cache.upsert_authorization(payload),
        ControlMessage::AuthorizationRemoved { payload } => {
            cache.remove_authorization(&payload.resource_id, &payload.principal_spiffe)
        }
        other => debug!("ignoring control message: {other:?}"),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztna_proto::message::TunnelerInfo;

    #[test]
    fn ping_yields_pong() {
        let allowlist = TunnelerAllowlist::new();
        let cache = PolicyCache::new(b"k".to_vec(), Duration::from_secs(60));
        let reply = handle_message(ControlMessage::Ping, &allowlist, &cache);
        assert_eq!(reply, Some(ControlMessage::Pong));
    }

    #[test]
    fn allowlist_messages_update_state() {
        let allowlist = TunnelerAllowlist::new();
        let cache = PolicyCache::new(b"k".to_vec(), Duration::from_secs(60));
        handle_message(
            ControlMessage::TunnelerAllowlist {
                payload: vec![TunnelerInfo {
                    tunneler_id: "t1".into(),
                    spiffe_id: "spiffe://td/tunneler/t1".into(),
                }],
            },
            &allowlist,
            &cache,
        );
        assert!(allowlist.contains("spiffe://td/tunneler/t1"));

        handle_message(
            ControlMessage::TunnelerAllow {
                payload: TunnelerInfo {
                    tunneler_id: "t2".into(),
                    spiffe_id: "spiffe://td/tunneler/t2".into(),
                },
            },
            &allowlist,
            &cache,
        );
        assert!(allowlist.contains("spiffe://td/tunneler/t2"));
    }

    #[test]
    fn rejected_snapshot_leaves_cache_empty() {
        let allowlist = TunnelerAllowlist::new();
        let cache = PolicyCache::new(b"k".to_vec(), Duration::from_secs(60));
        let snap = ztna_proto::snapshot::PolicySnapshot {
            snapshot_meta: ztna_proto::snapshot::SnapshotMeta {
                connector_id: "c".into(),
                policy_version: 1,
                compiled_at: String::new(),
                valid_until: String::new(),
                signature: "deadbeef".into(),
            },
            resources: Vec::new(),
        };
        handle_message(ControlMessage::AclInit { payload: snap }, &allowlist, &cache);
        assert!(!cache.has_snapshot());
    }
}
