//! Hot-swappable workload certificate store.
//!
//! The store holds the currently installed leaf + key as a rustls
//! `CertifiedKey` and hands it out through the server and client
//! certificate-resolution callbacks, so every new handshake picks up a
//! renewed credential without rebuilding TLS configs. Readers never block
//! each other; renewal takes the write lock only for the swap.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio_rustls::rustls::client::ResolvesClientCert;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::SignatureScheme;

#[derive(Debug, thiserror::Error)]
pub enum CertStoreError {
    #[error("unusable private key: {0}")]
    Key(tokio_rustls::rustls::Error),
}

struct Installed {
    certified: Arc<CertifiedKey>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

pub struct CertStore {
    inner: RwLock<Installed>,
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CertStore")
            .field("not_before", &inner.not_before)
            .field("not_after", &inner.not_after)
            .finish()
    }
}

impl CertStore {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Arc<Self>, CertStoreError> {
        let certified = Arc::new(certified_key(chain, key)?);
        Ok(Arc::new(CertStore {
            inner: RwLock::new(Installed {
                certified,
                not_before,
                not_after,
            }),
        }))
    }

    /// Atomically swap in a renewed credential.
    pub fn install(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<(), CertStoreError> {
        let certified = Arc::new(certified_key(chain, key)?);
        let mut inner = self.inner.write();
        *inner = Installed {
            certified,
            not_before,
            not_after,
        };
        Ok(())
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.inner.read().not_after
    }

    pub fn total_ttl(&self) -> Duration {
        let inner = self.inner.read();
        inner.not_after - inner.not_before
    }
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, CertStoreError> {
    let signing_key = tokio_rustls::rustls::crypto::ring::sign::any_ecdsa_type(&key)
        .map_err(CertStoreError::Key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.inner.read().certified.clone())
    }
}

impl ResolvesClientCert for CertStore {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.inner.read().certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}
