//! Control-plane server.
//!
//! One mTLS (TLS 1.3) listener carries three kinds of connections,
//! distinguished by their first frame: persistent connector streams
//! (`connector_hello`), one-shot enrollments (`enroll_request`, allowed
//! without a client certificate because the token authenticates them), and
//! one-shot renewals (`renew_request`, authenticated by the current leaf).
//!
//! Every accepted connector stream is registered in the client set under
//! its SPIFFE ID and immediately re-initialized with the tunneler
//! allowlist and a freshly compiled `acl_init` snapshot. Broadcasts copy
//! the sender handles out of the lock before touching the network, and a
//! slow client's queue overflowing drops the frame: the connector catches
//! up on its next reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{version::TLS13, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use ztna_proto::identity;
use ztna_proto::message::{
    self, AclAuthorization, AclResource, ControlMessage, EnrollRequest, EnrollResponse, ErrorInfo,
    RenewRequest, TunnelerInfo,
};
use ztna_proto::spiffe::{Role, SpiffeId};

use crate::ca::CertificateAuthority;
use crate::policy;
use crate::state::acl::AclStore;
use crate::state::db::Db;
use crate::state::registry::{ConnectorRegistry, TunnelerDirectory, TunnelerStatusRegistry};
use crate::state::tokens::{TokenError, TokenStore};

/// Outbound frames queued per client; overflow drops the frame.
const CLIENT_QUEUE: usize = 16;

struct ClientHandle {
    connector_id: String,
    tx: mpsc::Sender<ControlMessage>,
}

pub struct ControlPlane {
    pub trust_domain: String,
    pub controller_id: String,
    signing_key: Vec<u8>,
    policy_ttl: Duration,
    pub db: Arc<Db>,
    pub tokens: Arc<TokenStore>,
    ca: Arc<CertificateAuthority>,
    pub acls: Arc<AclStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub tunneler_status: Arc<TunnelerStatusRegistry>,
    pub admitted: Arc<TunnelerDirectory>,
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl ControlPlane {
    pub fn new(
        trust_domain: String,
        controller_id: String,
        signing_key: Vec<u8>,
        policy_ttl: Duration,
        db: Arc<Db>,
        tokens: Arc<TokenStore>,
        ca: Arc<CertificateAuthority>,
    ) -> Arc<Self> {
        Arc::new(ControlPlane {
            trust_domain,
            controller_id,
            signing_key,
            policy_ttl,
            db,
            tokens,
            ca,
            acls: Arc::new(AclStore::new()),
            connectors: Arc::new(ConnectorRegistry::new()),
            tunneler_status: Arc::new(TunnelerStatusRegistry::new()),
            admitted: Arc::new(TunnelerDirectory::new()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_pem(&self) -> &str {
        self.ca.ca_pem()
    }

    /// Compile the signed snapshot for one connector.
    pub fn compile_snapshot(
        &self,
        connector_id: &str,
    ) -> Result<ztna_proto::PolicySnapshot, policy::CompileError> {
        policy::compile(&self.db, connector_id, self.policy_ttl, &self.signing_key)
    }

    // ── Listener ───────────────────────────────────────────────────────

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = self.server_config().context("control-plane tls config")?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "control plane listening");
        }

        loop {
            let (tcp, peer_addr) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                accepted = listener.accept() => accepted.context("accept")?,
            };
            let acceptor = acceptor.clone();
            let server = self.clone();
            let mut conn_shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = conn_shutdown.changed() => {}
                    result = server.handle_connection(tcp, acceptor) => {
                        if let Err(e) = result {
                            debug!(peer = %peer_addr, "control connection ended: {e:#}");
                        }
                    }
                }
            });
        }
    }

    fn server_config(&self) -> Result<ServerConfig> {
        let spiffe = SpiffeId::new(
            self.trust_domain.clone(),
            Role::Controller,
            self.controller_id.clone(),
        );
        let (cert_pem, key) = self.ca.issue_local(&spiffe)?;
        let chain = identity::certs_from_pem(cert_pem.as_bytes())?;
        let roots = identity::root_store_from_pem(self.ca.ca_pem().as_bytes())?;
        // Client certs are verified against our own CA when present;
        // enrollment connections have none yet and are let through to be
        // authenticated by their token.
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .context("client verifier")?;
        let config = ServerConfig::builder_with_protocol_versions(&[&TLS13])
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                chain,
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .context("server certificate")?;
        Ok(config)
    }

    async fn handle_connection(
        self: &Arc<Self>,
        tcp: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        let stream = acceptor.accept(tcp).await.context("tls handshake")?;
        let peer = {
            let (_, conn) = stream.get_ref();
            conn.peer_certificates()
                .and_then(|certs| identity::peer_identity(certs).ok())
        };
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        let first = match lines.next_line().await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let first: ControlMessage = match serde_json::from_str(&first) {
            Ok(msg) => msg,
            Err(e) => {
                send_error(&mut write_half, "invalid_request", "undecodable frame").await;
                return Err(anyhow!("undecodable first frame: {e}"));
            }
        };

        match first {
            ControlMessage::ConnectorHello => {
                self.handle_connector_stream(peer, lines, write_half).await
            }
            ControlMessage::EnrollRequest { payload } => {
                self.handle_enroll(payload, &mut write_half).await
            }
            ControlMessage::RenewRequest { payload } => {
                self.handle_renew(peer, payload, &mut write_half).await
            }
            other => {
                send_error(&mut write_half, "invalid_request", "unexpected first frame").await;
                Err(anyhow!("unexpected first frame: {other:?}"))
            }
        }
    }

    // ── Connector streams ──────────────────────────────────────────────

    async fn handle_connector_stream(
        self: &Arc<Self>,
        peer: Option<SpiffeId>,
        mut lines: tokio::io::Lines<BufReader<ReadHalf<TlsStream<TcpStream>>>>,
        mut write_half: WriteHalf<TlsStream<TcpStream>>,
    ) -> Result<()> {
        let peer = match peer {
            Some(peer) if peer.role == Role::Connector && peer.trust_domain == self.trust_domain => {
                peer
            }
            other => {
                send_error(&mut write_half, "permission_denied", "connector role required").await;
                return Err(anyhow!("rejected control stream from {other:?}"));
            }
        };
        let spiffe_id = peer.to_string();
        let connector_id = peer.id.clone();
        info!(%spiffe_id, "control-plane stream connected");

        // All writes to this client flow through one queue so frames are
        // serialized; the writer task owns the write half.
        let (tx, mut rx) = mpsc::channel::<ControlMessage>(CLIENT_QUEUE);
        let writer_spiffe = spiffe_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = message::write_frame(&mut write_half, &msg).await {
                    warn!(spiffe_id = %writer_spiffe, "client write failed: {e}");
                    break;
                }
            }
        });
        self.clients.lock().insert(
            spiffe_id.clone(),
            ClientHandle {
                connector_id: connector_id.clone(),
                tx: tx.clone(),
            },
        );

        // Fresh sessions are re-initialized in full before any delta can
        // affect them.
        let _ = tx
            .send(ControlMessage::TunnelerAllowlist {
                payload: self.admitted.list(),
            })
            .await;
        match self.compile_snapshot(&connector_id) {
            Ok(snapshot) => {
                let _ = tx.send(ControlMessage::AclInit { payload: snapshot }).await;
            }
            Err(e) => warn!(%connector_id, "snapshot compile failed on connect: {e}"),
        }

        let result = loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(msg) => self.handle_inbound(&peer, msg, &tx).await,
                    Err(e) => warn!(%spiffe_id, "invalid control frame: {e}"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow!("stream read error: {e}")),
            }
        };

        self.clients.lock().remove(&spiffe_id);
        drop(tx);
        writer.abort();
        info!(%spiffe_id, "control-plane stream closed");
        result
    }

    async fn handle_inbound(
        &self,
        peer: &SpiffeId,
        msg: ControlMessage,
        tx: &mpsc::Sender<ControlMessage>,
    ) {
        match msg {
            ControlMessage::Ping => {
                let _ = tx.send(ControlMessage::Pong).await;
            }
            ControlMessage::Heartbeat {
                connector_id,
                private_ip,
                status,
            } => {
                debug!(%connector_id, %private_ip, %status, "heartbeat");
                let record = self
                    .connectors
                    .record_heartbeat(&connector_id, &private_ip, &status);
                if let Err(e) = self.db.save_connector(&record) {
                    warn!("persist connector heartbeat: {e}");
                }
            }
            ControlMessage::TunnelerHeartbeat { payload } => {
                let record = self.tunneler_status.record(
                    &payload.tunneler_id,
                    &payload.spiffe_id,
                    &payload.connector_id,
                    &payload.status,
                );
                if let Err(e) = self.db.save_tunneler(&record) {
                    warn!("persist tunneler heartbeat: {e}");
                }
            }
            ControlMessage::AclDecision { payload } => {
                info!(
                    principal = %payload.spiffe_id,
                    resource_id = %payload.resource_id,
                    dest = %payload.destination,
                    decision = %payload.decision,
                    reason = %payload.reason,
                    "acl decision"
                );
                if let Err(e) = self.db.append_audit(&payload) {
                    warn!("persist audit record: {e}");
                }
            }
            other => debug!(peer = %peer, "ignoring control message: {other:?}"),
        }
    }

    // ── Certificate lifecycle ──────────────────────────────────────────

    async fn handle_enroll(
        &self,
        payload: EnrollRequest,
        write_half: &mut WriteHalf<TlsStream<TcpStream>>,
    ) -> Result<()> {
        if let Err(e) = self.tokens.consume(&payload.token, &payload.connector_id) {
            let code = match e {
                TokenError::Expired => "token_expired",
                TokenError::Used => "token_used",
                _ => "token_invalid",
            };
            send_error(write_half, code, &e.to_string()).await;
            return Err(anyhow!("enrollment rejected: {e}"));
        }
        let spiffe = SpiffeId::new(
            self.trust_domain.clone(),
            Role::Connector,
            payload.connector_id.clone(),
        );
        self.issue_and_reply(&spiffe, &payload.csr_pem, write_half)
            .await
    }

    async fn handle_renew(
        &self,
        peer: Option<SpiffeId>,
        payload: RenewRequest,
        write_half: &mut WriteHalf<TlsStream<TcpStream>>,
    ) -> Result<()> {
        let authorized = matches!(
            &peer,
            Some(peer)
                if peer.role == Role::Connector
                    && peer.trust_domain == self.trust_domain
                    && peer.id == payload.connector_id
        );
        if !authorized {
            send_error(write_half, "permission_denied", "renewal requires the current leaf").await;
            return Err(anyhow!("rejected renewal from {peer:?}"));
        }
        let spiffe = SpiffeId::new(
            self.trust_domain.clone(),
            Role::Connector,
            payload.connector_id.clone(),
        );
        self.issue_and_reply(&spiffe, &payload.csr_pem, write_half)
            .await
    }

    async fn issue_and_reply(
        &self,
        spiffe: &SpiffeId,
        csr_pem: &str,
        write_half: &mut WriteHalf<TlsStream<TcpStream>>,
    ) -> Result<()> {
        let issued = match self.ca.issue(spiffe, csr_pem) {
            Ok(issued) => issued,
            Err(e) => {
                send_error(write_half, "invalid_request", &e.to_string()).await;
                return Err(anyhow!("issuance failed for {spiffe}: {e}"));
            }
        };
        info!(%spiffe, not_after = %issued.not_after, "certificate issued");
        message::write_frame(
            write_half,
            &ControlMessage::EnrollResponse {
                payload: EnrollResponse {
                    certificate: issued.cert_pem,
                    ca_certificate: self.ca.ca_pem().to_string(),
                    spiffe_id: spiffe.to_string(),
                },
            },
        )
        .await?;
        Ok(())
    }

    // ── Broadcast fan-out ──────────────────────────────────────────────

    /// Best-effort send to every connected connector. Handles are copied
    /// out of the lock first; a full or closed queue drops the frame.
    fn broadcast(&self, msg: ControlMessage) {
        let handles: Vec<(String, mpsc::Sender<ControlMessage>)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.tx.clone()))
            .collect();
        for (spiffe_id, tx) in handles {
            if let Err(e) = tx.try_send(msg.clone()) {
                warn!(%spiffe_id, "broadcast dropped: {e}");
            }
        }
    }

    /// Recompile and push a fresh snapshot to every connected connector.
    pub fn resync_all(&self) {
        let handles: Vec<(String, mpsc::Sender<ControlMessage>)> = self
            .clients
            .lock()
            .values()
            .map(|handle| (handle.connector_id.clone(), handle.tx.clone()))
            .collect();
        for (connector_id, tx) in handles {
            match self.compile_snapshot(&connector_id) {
                Ok(snapshot) => {
                    if tx.try_send(ControlMessage::AclInit { payload: snapshot }).is_err() {
                        warn!(%connector_id, "resync dropped: queue full");
                    }
                }
                Err(e) => warn!(%connector_id, "resync compile failed: {e}"),
            }
        }
    }

    // ── Admin mutations ────────────────────────────────────────────────

    pub fn notify_resource_upsert(&self, resource: AclResource) {
        self.broadcast(ControlMessage::ResourceUpdated { payload: resource });
    }

    pub fn notify_resource_removed(&self, resource_id: &str) {
        self.broadcast(ControlMessage::ResourceRemoved {
            payload: message::ResourceRef {
                resource_id: resource_id.to_string(),
            },
        });
    }

    pub fn notify_authorization_upsert(&self, auth: AclAuthorization) {
        self.broadcast(ControlMessage::AuthorizationUpdated { payload: auth });
    }

    pub fn notify_authorization_removed(&self, resource_id: &str, principal_spiffe: &str) {
        self.broadcast(ControlMessage::AuthorizationRemoved {
            payload: message::AuthorizationRef {
                resource_id: resource_id.to_string(),
                principal_spiffe: principal_spiffe.to_string(),
            },
        });
    }

    /// Admit a tunneler and announce it to the fleet.
    pub fn notify_tunneler_allowed(&self, tunneler_id: &str, spiffe_id: &str) {
        self.admitted.add(tunneler_id, spiffe_id);
        self.broadcast(ControlMessage::TunnelerAllow {
            payload: TunnelerInfo {
                tunneler_id: tunneler_id.to_string(),
                spiffe_id: spiffe_id.to_string(),
            },
        });
    }
}

async fn send_error(
    write_half: &mut WriteHalf<TlsStream<TcpStream>>,
    code: &str,
    message_text: &str,
) {
    let frame = ControlMessage::Error {
        payload: ErrorInfo {
            code: code.to_string(),
            message: message_text.to_string(),
        },
    };
    let _ = message::write_frame(write_half, &frame).await;
}
