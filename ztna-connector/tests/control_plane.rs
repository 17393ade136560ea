//! End-to-end control-plane tests.
//!
//! A real controller (in-process listener, scratch database, throwaway
//! CA) talks to the real connector client pieces: token enrollment,
//! certificate renewal with CA pinning, the initial allowlist + acl_init
//! push on a connector stream, and audit ingestion.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

use ztna_connector::certstore::CertStore;
use ztna_connector::{enroll, renewal, tls};
use ztna_controller::ca::CertificateAuthority;
use ztna_controller::control_plane::ControlPlane;
use ztna_controller::state::db::{Db, ResourceRow};
use ztna_controller::state::tokens::TokenStore;
use ztna_proto::message::{self, ControlMessage};
use ztna_proto::{identity, snapshot};

const SIGNING_KEY: &[u8] = b"e2e-signing-key";
const TRUST_DOMAIN: &str = "mycorp.internal";

struct Harness {
    cp: Arc<ControlPlane>,
    addr: String,
    _shutdown: watch::Sender<bool>,
    _ca_dir: tempfile::TempDir,
}

async fn start_controller() -> Harness {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let db = Arc::new(Db::open_memory().unwrap());
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
        port_from: None,
        port_to: None,
        remote_network_id: Some("net-1".into()),
    })
    .unwrap();
    db.save_access_rule("rule-1", "allow-db", "res-db", true).unwrap();
    db.add_rule_group("rule-1", "g1").unwrap();

    let ca_dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(
            ca_dir.path(),
            TRUST_DOMAIN,
            Duration::from_secs(3600),
        )
        .unwrap(),
    );
    let tokens = Arc::new(TokenStore::new(db.clone(), Duration::from_secs(600)));
    let cp = ControlPlane::new(
        TRUST_DOMAIN.to_string(),
        "controller".to_string(),
        SIGNING_KEY.to_vec(),
        Duration::from_secs(600),
        db,
        tokens,
        ca,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(cp.clone().serve(listener, shutdown_rx));

    Harness {
        cp,
        addr,
        _shutdown: shutdown_tx,
        _ca_dir: ca_dir,
    }
}

async fn enrolled_store(harness: &Harness) -> (Arc<CertStore>, Vec<u8>) {
    let (token, _) = harness.cp.tokens.mint().unwrap();
    let enrollment = enroll::enroll(&harness.addr, "con-1", &token, None)
        .await
        .unwrap();
    assert_eq!(
        enrollment.spiffe_id,
        format!("spiffe://{TRUST_DOMAIN}/connector/con-1")
    );
    let chain = identity::certs_from_pem(enrollment.cert_pem.as_bytes()).unwrap();
    let store = CertStore::new(
        chain,
        enrollment.private_key(),
        enrollment.not_before,
        enrollment.not_after,
    )
    .unwrap();
    (store, enrollment.ca_pem.into_bytes())
}

#[tokio::test]
async fn enrollment_requires_a_valid_token() {
    let harness = start_controller().await;
    let err = enroll::enroll(&harness.addr, "con-1", "bogus-token", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token_invalid"), "{err:#}");
}

#[tokio::test]
async fn token_is_single_use_across_connectors() {
    let harness = start_controller().await;
    let (token, _) = harness.cp.tokens.mint().unwrap();
    enroll::enroll(&harness.addr, "con-1", &token, None).await.unwrap();
    // Same connector may retry with the same token.
    enroll::enroll(&harness.addr, "con-1", &token, None).await.unwrap();
    // Anyone else is rejected.
    let err = enroll::enroll(&harness.addr, "con-2", &token, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token_used"), "{err:#}");
}

#[tokio::test]
async fn renewal_swaps_the_credential_and_pins_the_ca() {
    let harness = start_controller().await;
    let (store, ca_pem) = enrolled_store(&harness).await;

    let before = store.not_after();
    let not_after = renewal::renew_once(&harness.addr, "con-1", &store, &ca_pem)
        .await
        .unwrap();
    assert!(not_after >= before - chrono::Duration::seconds(5));

    // A different CA bundle must abort the renewal.
    let other_dir = tempfile::tempdir().unwrap();
    let other_ca = CertificateAuthority::load_or_generate(
        other_dir.path(),
        TRUST_DOMAIN,
        Duration::from_secs(3600),
    )
    .unwrap();
    let err = renewal::renew_once(
        &harness.addr,
        "con-1",
        &store,
        other_ca.ca_pem().as_bytes(),
    )
    .await
    .unwrap_err();
    // The pinned bundle no longer matches what the controller serves, so
    // the handshake itself (or the pin check) must fail.
    assert!(!err.to_string().is_empty());
}

#[tokio::test]
async fn connector_stream_gets_allowlist_then_snapshot() {
    let harness = start_controller().await;
    harness.cp.notify_tunneler_allowed("t1", "spiffe://mycorp.internal/tunneler/t1");
    let (store, ca_pem) = enrolled_store(&harness).await;

    let config = tls::mtls_client_config(store, &ca_pem).unwrap();
    let tcp = TcpStream::connect(&harness.addr).await.unwrap();
    let stream = TlsConnector::from(Arc::new(config))
        .connect(tls::server_name(&harness.addr).unwrap(), tcp)
        .await
        .unwrap();
    let (read_half, mut write_half) = tokio::io::split(stream);
    message::write_frame(&mut write_half, &ControlMessage::ConnectorHello)
        .await
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let first: ControlMessage =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    match first {
        ControlMessage::TunnelerAllowlist { payload } => {
            assert_eq!(payload.len(), 1);
            assert_eq!(payload[0].tunneler_id, "t1");
        }
        other => panic!("expected tunneler_allowlist, got {other:?}"),
    }

    let second: ControlMessage =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    match second {
        ControlMessage::AclInit { payload } => {
            assert!(snapshot::verify(SIGNING_KEY, &payload));
            assert_eq!(payload.snapshot_meta.connector_id, "con-1");
            assert_eq!(payload.resources.len(), 1);
            assert_eq!(payload.resources[0].resource_id, "res-db");
            assert_eq!(payload.resources[0].allowed_identities, vec!["identity-1"]);
        }
        other => panic!("expected acl_init, got {other:?}"),
    }

    // Ping is answered on the same stream.
    message::write_frame(&mut write_half, &ControlMessage::Ping)
        .await
        .unwrap();
    let pong: ControlMessage =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(pong, ControlMessage::Pong);

    // Heartbeats land in the registry; decisions land in the audit log.
    message::write_frame(
        &mut write_half,
        &ControlMessage::Heartbeat {
            connector_id: "con-1".into(),
            private_ip: "10.0.0.5".into(),
            status: "ONLINE".into(),
        },
    )
    .await
    .unwrap();
    message::write_frame(
        &mut write_half,
        &ControlMessage::AclDecision {
            payload: ztna_proto::message::DecisionRecord {
                tunneler_id: "t1".into(),
                spiffe_id: "spiffe://mycorp.internal/tunneler/t1".into(),
                resource_id: "res-db".into(),
                destination: "db.internal".into(),
                protocol: "TCP".into(),
                port: 5432,
                decision: "allow".into(),
                reason: "allowed".into(),
                connector_id: "con-1".into(),
                connection_id: "conn-1".into(),
            },
        },
    )
    .await
    .unwrap();

    // Give the server a beat to process both frames.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = harness.cp.connectors.get("con-1").expect("heartbeat recorded");
    assert_eq!(record.private_ip, "10.0.0.5");
    let audit = harness.cp.db.list_audit(10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].reason, "allowed");
}

#[tokio::test]
async fn tunneler_certificate_cannot_open_a_connector_stream() {
    let harness = start_controller().await;
    let (token, _) = harness.cp.tokens.mint().unwrap();
    enroll::enroll(&harness.addr, "con-1", &token, None).await.unwrap();

    // Mint a tunneler identity directly from the CA side by enrolling a
    // second connector and rewriting the role is not possible; instead,
    // connect with no client certificate at all.
    let config = tls::bootstrap_client_config(None).unwrap();
    let tcp = TcpStream::connect(&harness.addr).await.unwrap();
    let stream = TlsConnector::from(Arc::new(config))
        .connect(tls::server_name(&harness.addr).unwrap(), tcp)
        .await
        .unwrap();
    let (read_half, mut write_half) = tokio::io::split(stream);
    message::write_frame(&mut write_half, &ControlMessage::ConnectorHello)
        .await
        .unwrap();
    let mut lines = BufReader::new(read_half).lines();
    let reply: ControlMessage =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    match reply {
        ControlMessage::Error { payload } => assert_eq!(payload.code, "permission_denied"),
        other => panic!("expected permission_denied, got {other:?}"),
    }
}
