//! TLS configuration for the connector's three connection kinds:
//! the mTLS control/renewal client, the tunneler-facing mTLS server, and
//! the one-shot enrollment bootstrap.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::rustls::{self, version::TLS13};

use crate::certstore::CertStore;
use ztna_proto::identity;

/// mTLS client config: our leaf via the cert store resolver, the peer
/// verified against the pinned CA.
pub fn mtls_client_config(store: Arc<CertStore>, ca_pem: &[u8]) -> Result<ClientConfig> {
    let roots = identity::root_store_from_pem(ca_pem).context("pinned CA bundle")?;
    Ok(ClientConfig::builder_with_protocol_versions(&[&TLS13])
        .with_root_certificates(roots)
        .with_client_cert_resolver(store))
}

/// mTLS server config for the tunneler handler: client certificates are
/// required and must chain to the pinned CA.
pub fn mtls_server_config(store: Arc<CertStore>, ca_pem: &[u8]) -> Result<ServerConfig> {
    let roots = identity::root_store_from_pem(ca_pem).context("pinned CA bundle")?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("client certificate verifier")?;
    Ok(ServerConfig::builder_with_protocol_versions(&[&TLS13])
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(store))
}

/// Enrollment bootstrap client config. With a CA file the controller is
/// verified normally; without one, the single token-authenticated exchange
/// accepts the presented server certificate and pins the CA returned in
/// the response for every later connection.
pub fn bootstrap_client_config(ca_pem: Option<&[u8]>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_protocol_versions(&[&TLS13]);
    let config = match ca_pem {
        Some(pem) => builder
            .with_root_certificates(identity::root_store_from_pem(pem)?)
            .with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustOnBootstrap::new()))
            .with_no_client_auth(),
    };
    Ok(config)
}

/// The TLS server name for a `host:port` dial target.
pub fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {host}: {e}"))
}

/// Accepts whatever certificate the server presents. Used only for the
/// one-shot enrollment exchange, which is authenticated by the enrollment
/// token; everything after enrollment verifies against the pinned CA.
#[derive(Debug)]
struct TrustOnBootstrap {
    provider: Arc<CryptoProvider>,
}

impl TrustOnBootstrap {
    fn new() -> Self {
        TrustOnBootstrap {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for TrustOnBootstrap {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_strips_port() {
        assert!(server_name("controller.mycorp.internal:8443").is_ok());
        assert!(server_name("10.0.0.1:8443").is_ok());
        assert!(server_name("controller.mycorp.internal").is_ok());
    }
}
