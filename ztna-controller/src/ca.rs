//! Certificate authority.
//!
//! The controller anchors fleet identity: it loads (or generates once and
//! persists) an ECDSA P-256 CA, and signs leaf certificates from CSRs,
//! overriding the requested subject and SAN with the identity it has on
//! record. Subjects prove key possession via the CSR; the embedded SPIFFE
//! URI is entirely controller-chosen.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use ztna_proto::spiffe::SpiffeId;

/// Allow modest clock skew between controller and fleet.
const NOT_BEFORE_SKEW: TimeDuration = TimeDuration::minutes(5);
const CA_LIFETIME_DAYS: i64 = 3650;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("ca state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid csr: {0}")]
    InvalidCsr(String),
}

pub struct IssuedCert {
    pub cert_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// The canonical bundle handed to enrollees; pinned fleet-wide.
    ca_pem: String,
    leaf_ttl: TimeDuration,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a fresh one on
    /// first start.
    pub fn load_or_generate(
        dir: &Path,
        trust_domain: &str,
        leaf_ttl: std::time::Duration,
    ) -> Result<Self, CaError> {
        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca.key");
        let leaf_ttl =
            TimeDuration::try_from(leaf_ttl).unwrap_or_else(|_| TimeDuration::hours(24));

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path, leaf_ttl);
        }

        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{trust_domain} internal ca"));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + TimeDuration::days(CA_LIFETIME_DAYS);
        let ca_cert = params.self_signed(&ca_key)?;
        let ca_pem = ca_cert.pem();

        std::fs::create_dir_all(dir)?;
        std::fs::write(&cert_path, &ca_pem)?;
        std::fs::write(&key_path, ca_key.serialize_pem())?;
        info!(path = %cert_path.display(), "generated new internal CA");

        Ok(CertificateAuthority {
            ca_cert,
            ca_key,
            ca_pem,
            leaf_ttl,
        })
    }

    fn load(cert_path: &PathBuf, key_path: &PathBuf, leaf_ttl: TimeDuration) -> Result<Self, CaError> {
        // The persisted PEM stays the canonical bundle: re-deriving the
        // issuer from it keeps the signing name and key stable while the
        // regenerated in-memory certificate is never handed out.
        let ca_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let ca_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&ca_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(CertificateAuthority {
            ca_cert,
            ca_key,
            ca_pem,
            leaf_ttl,
        })
    }

    /// The PEM bundle enrollees pin.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Sign a leaf for the given identity from a CSR.
    pub fn issue(&self, spiffe: &SpiffeId, csr_pem: &str) -> Result<IssuedCert, CaError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let not_before = now - NOT_BEFORE_SKEW;
        let not_after = now + self.leaf_ttl;
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;
        csr.params.distinguished_name = DistinguishedName::new();
        csr.params
            .distinguished_name
            .push(DnType::CommonName, spiffe.id.as_str());
        csr.params.subject_alt_names = vec![SanType::URI(
            spiffe
                .to_string()
                .try_into()
                .map_err(|_| CaError::InvalidCsr("identity not IA5".to_string()))?,
        )];
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

        let cert = csr.signed_by(&self.ca_cert, &self.ca_key)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            not_before: Utc
                .timestamp_opt(not_before.unix_timestamp(), 0)
                .single()
                .unwrap_or_else(Utc::now),
            not_after: Utc
                .timestamp_opt(not_after.unix_timestamp(), 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    /// Issue the controller's own serving certificate.
    pub fn issue_local(&self, spiffe: &SpiffeId) -> Result<(String, KeyPair), CaError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::ExplicitNoCa;
        params
            .distinguished_name
            .push(DnType::CommonName, spiffe.id.as_str());
        params.subject_alt_names = vec![SanType::URI(
            spiffe
                .to_string()
                .try_into()
                .map_err(|_| CaError::InvalidCsr("identity not IA5".to_string()))?,
        )];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + TimeDuration::days(CA_LIFETIME_DAYS);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        Ok((cert.pem(), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ztna_proto::identity;
    use ztna_proto::spiffe::Role;

    fn test_ca(dir: &Path) -> CertificateAuthority {
        CertificateAuthority::load_or_generate(dir, "mycorp.internal", Duration::from_secs(86400))
            .unwrap()
    }

    fn csr() -> String {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "whatever");
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn issued_leaf_carries_controller_chosen_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());
        let spiffe = SpiffeId::new("mycorp.internal", Role::Connector, "con-1");
        let issued = ca.issue(&spiffe, &csr()).unwrap();

        let certs = identity::certs_from_pem(issued.cert_pem.as_bytes()).unwrap();
        let peer = identity::peer_identity(&certs).unwrap();
        assert_eq!(peer, spiffe);
        assert!(issued.not_before < issued.not_after);
    }

    #[test]
    fn ca_bundle_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first_pem = test_ca(dir.path()).ca_pem().to_string();
        let second_pem = test_ca(dir.path()).ca_pem().to_string();
        // Byte-equal across restarts: the fleet pins this bundle.
        assert_eq!(first_pem, second_pem);
    }

    #[test]
    fn garbage_csr_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());
        let spiffe = SpiffeId::new("mycorp.internal", Role::Connector, "con-1");
        assert!(matches!(
            ca.issue(&spiffe, "not a csr"),
            Err(CaError::InvalidCsr(_))
        ));
    }
}
