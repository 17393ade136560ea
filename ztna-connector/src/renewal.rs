//! Rolling certificate renewal.
//!
//! The next renewal fires when 30% of the certificate's total TTL remains,
//! never sooner than 10 seconds out. A renewal generates a fresh key, asks
//! the controller to re-sign over the existing mTLS channel, requires the
//! returned CA to be byte-equal to the pinned bundle, and atomically swaps
//! the new credential into the cert store. Failures log and retry at the
//! next scheduled tick; the existing certificate stays valid meanwhile.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use ztna_proto::identity;
use ztna_proto::message::{ControlMessage, RenewRequest};

use crate::certstore::CertStore;
use crate::enroll::{exchange_once, generate_key_and_csr};
use crate::tls;

/// When to renew a certificate expiring at `not_after` with the given
/// total TTL: `not_after - 30% * total_ttl`, clamped to at least 10 s from
/// now.
pub fn next_renewal(not_after: DateTime<Utc>, total_ttl: Duration) -> DateTime<Utc> {
    let min_lead = Duration::seconds(10);
    let now = Utc::now();
    let remaining = not_after - now;
    if remaining <= Duration::zero() {
        return now + min_lead;
    }
    let total = if total_ttl <= Duration::zero() {
        remaining
    } else {
        total_ttl
    };
    let next = not_after - total * 30 / 100;
    if next < now + min_lead {
        now + min_lead
    } else {
        next
    }
}

/// Long-running renewal supervisor.
pub async fn renewal_loop(
    controller_addr: String,
    connector_id: String,
    store: Arc<CertStore>,
    ca_pem: Vec<u8>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = next_renewal(store.not_after(), store.total_ttl());
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::from_secs(0));
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        match renew_once(&controller_addr, &connector_id, &store, &ca_pem).await {
            Ok(not_after) => info!(%not_after, "certificate renewed"),
            Err(e) => warn!("certificate renewal failed: {e:#}"),
        }
    }
}

/// One renewal attempt. On success the new credential is installed and the
/// new `not_after` returned.
pub async fn renew_once(
    controller_addr: &str,
    connector_id: &str,
    store: &Arc<CertStore>,
    ca_pem: &[u8],
) -> Result<DateTime<Utc>> {
    let (key, csr_pem) = generate_key_and_csr(connector_id)?;
    let config = tls::mtls_client_config(store.clone(), ca_pem)?;
    let request = ControlMessage::RenewRequest {
        payload: RenewRequest {
            connector_id: connector_id.to_string(),
            csr_pem,
        },
    };
    let response = exchange_once(controller_addr, config, &request)
        .await
        .context("renewal exchange")?;
    let payload = match response {
        ControlMessage::EnrollResponse { payload } => payload,
        ControlMessage::Error { payload } => {
            bail!("renewal rejected: {} ({})", payload.message, payload.code)
        }
        other => bail!("unexpected renewal response: {other:?}"),
    };
    if payload.ca_certificate.is_empty() {
        bail!("empty CA certificate in renewal response");
    }
    if !identity::ca_bundles_equal(ca_pem, payload.ca_certificate.as_bytes()) {
        bail!("internal CA mismatch during renewal");
    }
    let chain = identity::certs_from_pem(payload.certificate.as_bytes())
        .context("parse renewed certificate")?;
    let (not_before, not_after) = identity::leaf_validity(payload.certificate.as_bytes())?;
    store
        .install(
            chain,
            tokio_rustls::rustls::pki_types::PrivateKeyDer::Pkcs8(
                tokio_rustls::rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()),
            ),
            not_before,
            not_after,
        )
        .context("install renewed certificate")?;
    Ok(not_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renews_at_seventy_percent_of_ttl() {
        let now = Utc::now();
        let not_after = now + Duration::hours(10);
        let next = next_renewal(not_after, Duration::hours(10));
        // 30% of 10h = 3h before expiry, i.e. 7h from now.
        let expect = not_after - Duration::hours(3);
        assert!((next - expect).num_seconds().abs() < 2);
    }

    #[test]
    fn expired_cert_renews_almost_immediately() {
        let now = Utc::now();
        let next = next_renewal(now - Duration::hours(1), Duration::hours(10));
        let lead = next - now;
        assert!(lead >= Duration::seconds(9) && lead <= Duration::seconds(11));
    }

    #[test]
    fn minimum_lead_time_enforced() {
        let now = Utc::now();
        // 30% of 10s leaves the renewal point in the past; clamp to +10s.
        let next = next_renewal(now + Duration::seconds(2), Duration::seconds(10));
        assert!(next - now >= Duration::seconds(9));
    }

    #[test]
    fn zero_ttl_falls_back_to_remaining() {
        let now = Utc::now();
        let not_after = now + Duration::hours(10);
        let next = next_renewal(not_after, Duration::zero());
        let expect = not_after - Duration::hours(3);
        assert!((next - expect).num_seconds().abs() < 2);
    }
}
