//! Single-use enrollment tokens.
//!
//! Raw tokens are never persisted: only the SHA-256 hash is stored, with
//! an expiry and, once consumed, the connector it was bound to. Consuming
//! an already-used token is idempotent for the same connector and an error
//! for any other.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::db::{Db, TokenRow};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing token")]
    Missing,
    #[error("missing connector id")]
    MissingConnectorId,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token already used")]
    Used,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub struct TokenStore {
    db: Arc<Db>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(db: Arc<Db>, ttl: Duration) -> Self {
        TokenStore { db, ttl }
    }

    /// Mint a fresh token. The raw value is returned exactly once.
    pub fn mint(&self) -> Result<(String, DateTime<Utc>), TokenError> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let expires_at = Utc::now() + ttl;
        self.db.save_token(&TokenRow {
            hash: hash_token(&token),
            expires_at: expires_at.timestamp(),
            used: false,
            connector_id: None,
        })?;
        Ok((token, expires_at))
    }

    /// Revoke every token bound to a connector, e.g. when the connector
    /// itself is deleted.
    pub fn revoke_for_connector(&self, connector_id: &str) -> Result<usize, TokenError> {
        if connector_id.is_empty() {
            return Ok(0);
        }
        Ok(self.db.delete_tokens_for_connector(connector_id)?)
    }

    /// Validate and burn a token, binding it to the enrolling connector.
    pub fn consume(&self, token: &str, connector_id: &str) -> Result<(), TokenError> {
        if token.is_empty() {
            return Err(TokenError::Missing);
        }
        if connector_id.is_empty() {
            return Err(TokenError::MissingConnectorId);
        }
        let hash = hash_token(token);
        let Some(mut row) = self.db.token(&hash)? else {
            return Err(TokenError::Invalid);
        };
        let expires_at = Utc.timestamp_opt(row.expires_at, 0).single();
        if let Some(expires_at) = expires_at {
            if row.expires_at != 0 && Utc::now() > expires_at {
                return Err(TokenError::Expired);
            }
        }
        if row.used {
            if row.connector_id.as_deref() == Some(connector_id) {
                return Ok(());
            }
            return Err(TokenError::Used);
        }
        row.used = true;
        row.connector_id = Some(connector_id.to_string());
        self.db.save_token(&row)?;
        Ok(())
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
