//! Control-plane wire messages.
//!
//! Every control connection carries newline-delimited JSON frames; each
//! frame is one [`ControlMessage`], discriminated by its `type` field.
//! Typed event payloads sit under a `payload` key:
//!
//! ```json
//! {"type":"heartbeat","connector_id":"con-1","private_ip":"10.0.0.5","status":"ONLINE"}
//! {"type":"acl_init","payload":{"snapshot_meta":{...},"resources":[...]}}
//! ```
//!
//! Frames on a single connection are strictly ordered in each direction;
//! there is no ordering guarantee across connections.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::snapshot::PolicySnapshot;

/// An admitted tunneler: its logical id and certificate identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelerInfo {
    pub tunneler_id: String,
    pub spiffe_id: String,
}

/// Per-edge protocol/port constraint on an authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclFilter {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "port_is_zero")]
    pub port_range_start: u16,
    #[serde(default, skip_serializing_if = "port_is_zero")]
    pub port_range_end: u16,
}

fn port_is_zero(port: &u16) -> bool {
    *port == 0
}

/// A resource as carried by incremental delta messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclResource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_network_id: Option<String>,
}

/// An authorization edge: identity → resource, optionally filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclAuthorization {
    pub principal_spiffe: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<AclFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRef {
    pub resource_id: String,
    pub principal_spiffe: String,
}

/// Tunneler liveness report, enriched with the local connector id before
/// it is forwarded upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelerStatus {
    #[serde(default)]
    pub tunneler_id: String,
    #[serde(default)]
    pub spiffe_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub connector_id: String,
}

/// An admission request from a tunneler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelerRequest {
    pub destination: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
}

/// The audited outcome of an admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub tunneler_id: String,
    pub spiffe_id: String,
    pub resource_id: String,
    pub destination: String,
    pub protocol: String,
    pub port: u16,
    /// `allow` or `deny`.
    pub decision: String,
    pub reason: String,
    pub connector_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub connector_id: String,
    pub token: String,
    pub csr_pem: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewRequest {
    pub connector_id: String,
    pub csr_pem: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// PEM-encoded leaf certificate.
    pub certificate: String,
    /// PEM-encoded CA bundle.
    pub ca_certificate: String,
    pub spiffe_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// One wire frame. The serde tag is the on-wire `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // Session plumbing.
    ConnectorHello,
    Heartbeat {
        connector_id: String,
        private_ip: String,
        status: String,
    },
    Ping,
    Pong,

    // Controller → connector.
    TunnelerAllowlist { payload: Vec<TunnelerInfo> },
    AclInit { payload: PolicySnapshot },
    ResourceUpdated { payload: AclResource },
    ResourceRemoved { payload: ResourceRef },
    AuthorizationUpdated { payload: AclAuthorization },
    AuthorizationRemoved { payload: AuthorizationRef },
    TunnelerAllow { payload: TunnelerInfo },

    // Connector → controller.
    TunnelerHeartbeat { payload: TunnelerStatus },
    AclDecision { payload: DecisionRecord },

    // Tunneler ↔ connector.
    TunnelerRequest { payload: TunnelerRequest },
    TunnelerDecision { payload: DecisionRecord },

    // Certificate lifecycle (one-shot exchanges).
    EnrollRequest { payload: EnrollRequest },
    RenewRequest { payload: RenewRequest },
    EnrollResponse { payload: EnrollResponse },

    Error { payload: ErrorInfo },
}

/// Serialize a frame and write it as one newline-terminated line.
pub async fn write_frame<W>(writer: &mut W, msg: &ControlMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_names() {
        let hello = serde_json::to_value(ControlMessage::ConnectorHello).unwrap();
        assert_eq!(hello["type"], "connector_hello");

        let hb = serde_json::to_value(ControlMessage::Heartbeat {
            connector_id: "con-1".into(),
            private_ip: "10.0.0.5".into(),
            status: "ONLINE".into(),
        })
        .unwrap();
        assert_eq!(hb["type"], "heartbeat");
        assert_eq!(hb["connector_id"], "con-1");
        assert_eq!(hb["private_ip"], "10.0.0.5");
        assert_eq!(hb["status"], "ONLINE");

        let removed = serde_json::to_value(ControlMessage::ResourceRemoved {
            payload: ResourceRef {
                resource_id: "res-1".into(),
            },
        })
        .unwrap();
        assert_eq!(removed["type"], "resource_removed");
        assert_eq!(removed["payload"]["resource_id"], "res-1");
    }

    #[test]
    fn decode_dispatches_on_type() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"tunneler_request","payload":{"destination":"db.internal","protocol":"TCP","port":5432}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::TunnelerRequest { payload } => {
                assert_eq!(payload.destination, "db.internal");
                assert_eq!(payload.port, 5432);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn request_fields_default() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"tunneler_request","payload":{"destination":"db.internal"}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::TunnelerRequest { payload } => {
                assert_eq!(payload.protocol, "");
                assert_eq!(payload.port, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn authorization_filters_optional() {
        let auth: AclAuthorization = serde_json::from_str(
            r#"{"principal_spiffe":"identity-1","resource_id":"res-1"}"#,
        )
        .unwrap();
        assert!(auth.filters.is_empty());

        let auth: AclAuthorization = serde_json::from_str(
            r#"{"principal_spiffe":"identity-1","resource_id":"res-1",
                "filters":[{"protocol":"tcp","port_range_start":80,"port_range_end":443}]}"#,
        )
        .unwrap();
        assert_eq!(auth.filters.len(), 1);
        assert_eq!(auth.filters[0].port_range_end, 443);
    }

    #[tokio::test]
    async fn frames_are_newline_terminated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ControlMessage::Ping).await.unwrap();
        write_frame(&mut buf, &ControlMessage::Pong).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"type":"ping"}"#, r#"{"type":"pong"}"#]);
    }
}
