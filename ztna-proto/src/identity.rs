//! TLS peer-identity and CA-bundle helpers.
//!
//! Chain validation happens inside rustls against the pinned CA roots; the
//! helpers here extract the SPIFFE identity from an already-verified chain
//! and normalize CA bundles for byte-equality pinning.

use chrono::{DateTime, TimeZone, Utc};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::RootCertStore;
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::{GeneralName, ParsedExtension};

use crate::spiffe::{SpiffeId, SpiffeIdError};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("peer presented no certificate")]
    NoCertificate,
    #[error("certificate parse failed: {0}")]
    Parse(String),
    #[error("no spiffe URI SAN in certificate")]
    NoSpiffeSan,
    #[error(transparent)]
    Spiffe(#[from] SpiffeIdError),
}

/// Extract the SPIFFE identity from the leaf of a presented chain.
pub fn peer_identity(certs: &[CertificateDer<'_>]) -> Result<SpiffeId, IdentityError> {
    let leaf = certs.first().ok_or(IdentityError::NoCertificate)?;
    let (_, cert) =
        parse_x509_certificate(leaf.as_ref()).map_err(|e| IdentityError::Parse(e.to_string()))?;
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    if uri.starts_with("spiffe://") {
                        return Ok(uri.parse()?);
                    }
                }
            }
        }
    }
    Err(IdentityError::NoSpiffeSan)
}

/// Parse all CERTIFICATE blocks out of a PEM bundle.
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| IdentityError::Parse(e.to_string()))?;
    if certs.is_empty() {
        return Err(IdentityError::NoCertificate);
    }
    Ok(certs)
}

/// Build a rustls root store from a PEM CA bundle.
pub fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore, IdentityError> {
    let mut store = RootCertStore::empty();
    let (added, _) = store.add_parsable_certificates(certs_from_pem(pem)?);
    if added == 0 {
        return Err(IdentityError::Parse("no usable CA certificates".to_string()));
    }
    Ok(store)
}

/// Compare two CA bundles after normalization: PEM decoration, ordering of
/// unrelated blocks, and whitespace do not matter; the DER contents do.
pub fn ca_bundles_equal(a: &[u8], b: &[u8]) -> bool {
    match (certs_from_pem(a), certs_from_pem(b)) {
        (Ok(mut ca), Ok(mut cb)) => {
            let key = |c: &CertificateDer<'static>| c.as_ref().to_vec();
            ca.sort_by_key(key);
            cb.sort_by_key(key);
            ca.len() == cb.len()
                && ca
                    .iter()
                    .zip(cb.iter())
                    .all(|(x, y)| x.as_ref() == y.as_ref())
        }
        _ => false,
    }
}

/// Validity window of the leaf certificate in a PEM bundle.
pub fn leaf_validity(cert_pem: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), IdentityError> {
    let certs = certs_from_pem(cert_pem)?;
    let (_, cert) =
        parse_x509_certificate(certs[0].as_ref()).map_err(|e| IdentityError::Parse(e.to_string()))?;
    let validity = cert.validity();
    let not_before = Utc
        .timestamp_opt(validity.not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| IdentityError::Parse("invalid notBefore".to_string()))?;
    let not_after = Utc
        .timestamp_opt(validity.not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| IdentityError::Parse("invalid notAfter".to_string()))?;
    Ok((not_before, not_after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair, SanType};

    fn leaf_with_san(uri: &str) -> String {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "test-leaf");
        params.subject_alt_names = vec![SanType::URI(uri.try_into().unwrap())];
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn extracts_spiffe_identity() {
        let pem = leaf_with_san("spiffe://mycorp.internal/connector/con-1");
        let certs = certs_from_pem(pem.as_bytes()).unwrap();
        let id = peer_identity(&certs).unwrap();
        assert_eq!(id.to_string(), "spiffe://mycorp.internal/connector/con-1");
    }

    #[test]
    fn rejects_non_spiffe_san() {
        let pem = leaf_with_san("https://example.com/whatever");
        let certs = certs_from_pem(pem.as_bytes()).unwrap();
        assert!(matches!(
            peer_identity(&certs),
            Err(IdentityError::NoSpiffeSan)
        ));
    }

    #[test]
    fn empty_chain_rejected() {
        assert!(matches!(
            peer_identity(&[]),
            Err(IdentityError::NoCertificate)
        ));
    }

    #[test]
    fn bundle_equality_ignores_decoration() {
        let pem = leaf_with_san("spiffe://td/controller/c");
        let with_noise = format!("\n# comment\n{pem}\n");
        assert!(ca_bundles_equal(pem.as_bytes(), with_noise.as_bytes()));

        let other = leaf_with_san("spiffe://td/controller/c");
        assert!(!ca_bundles_equal(pem.as_bytes(), other.as_bytes()));
    }

    #[test]
    fn leaf_validity_is_ordered() {
        let pem = leaf_with_san("spiffe://td/connector/x");
        let (not_before, not_after) = leaf_validity(pem.as_bytes()).unwrap();
        assert!(not_before < not_after);
    }
}
