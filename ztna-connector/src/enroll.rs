//! Enrollment: the one-shot bootstrap that turns an enrollment token into
//! a workload certificate, the CA bundle, and a SPIFFE identity.
//!
//! The connector generates a fresh ECDSA P-256 key, sends a CSR together
//! with the single-use token, and installs the returned leaf. The CA
//! returned here is pinned for the lifetime of the process; renewals must
//! return a byte-equal bundle.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::info;

use ztna_proto::identity;
use ztna_proto::message::{self, ControlMessage, EnrollRequest};

use crate::tls;

/// Everything enrollment produces.
#[derive(Debug)]
pub struct Enrollment {
    pub cert_pem: String,
    pub ca_pem: String,
    pub spiffe_id: String,
    pub key_pkcs8: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Enrollment {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }
}

/// Generate a fresh P-256 key and a CSR naming the connector.
pub fn generate_key_and_csr(connector_id: &str) -> Result<(rcgen::KeyPair, String)> {
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .context("generate workload key")?;
    let mut params = rcgen::CertificateParams::new(Vec::new()).context("csr params")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, connector_id);
    let csr = params.serialize_request(&key).context("serialize csr")?;
    let csr_pem = csr.pem().context("encode csr")?;
    Ok((key, csr_pem))
}

/// Perform the one-shot enrollment exchange.
pub async fn enroll(
    controller_addr: &str,
    connector_id: &str,
    token: &str,
    controller_ca_pem: Option<&[u8]>,
) -> Result<Enrollment> {
    if token.is_empty() {
        bail!("ENROLLMENT_TOKEN is required for enrollment");
    }
    let (key, csr_pem) = generate_key_and_csr(connector_id)?;
    let config = tls::bootstrap_client_config(controller_ca_pem)?;
    let request = ControlMessage::EnrollRequest {
        payload: EnrollRequest {
            connector_id: connector_id.to_string(),
            token: token.to_string(),
            csr_pem,
        },
    };
    let response = exchange_once(controller_addr, config, &request)
        .await
        .context("enrollment exchange")?;
    let payload = match response {
        ControlMessage::EnrollResponse { payload } => payload,
        ControlMessage::Error { payload } => {
            bail!("enrollment rejected: {} ({})", payload.message, payload.code)
        }
        other => bail!("unexpected enrollment response: {other:?}"),
    };
    if payload.ca_certificate.is_empty() {
        bail!("empty CA certificate in enrollment response");
    }
    let (not_before, not_after) = identity::leaf_validity(payload.certificate.as_bytes())
        .context("parse enrolled certificate")?;
    info!(spiffe_id = %payload.spiffe_id, %not_after, "connector enrolled");
    Ok(Enrollment {
        cert_pem: payload.certificate,
        ca_pem: payload.ca_certificate,
        spiffe_id: payload.spiffe_id,
        key_pkcs8: key.serialize_der(),
        not_before,
        not_after,
    })
}

/// Dial, send one frame, read one frame, hang up.
pub async fn exchange_once(
    addr: &str,
    config: ClientConfig,
    request: &ControlMessage,
) -> Result<ControlMessage> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector
        .connect(tls::server_name(addr)?, tcp)
        .await
        .context("tls handshake")?;
    let (read_half, mut write_half) = tokio::io::split(stream);
    message::write_frame(&mut write_half, request).await?;
    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await
        .context("read response")?
        .context("connection closed without a response")?;
    serde_json::from_str(&line).context("decode response frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_has_pem_armor() {
        let (_, csr_pem) = generate_key_and_csr("con-1").unwrap();
        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[tokio::test]
    async fn empty_token_rejected_before_dialing() {
        let err = enroll("127.0.0.1:1", "con-1", "", None).await.unwrap_err();
        assert!(err.to_string().contains("ENROLLMENT_TOKEN"));
    }
}
