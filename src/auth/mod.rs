// SPDX-License-Identifier: MIT
//! Handshake authentication: input checks, token verification, and the
//! credential-store comparison with fail-open semantics.

pub mod token;

use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use token::TokenDecoder;

/// The authenticated identity, computed once at handshake and immutable
/// for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_uuid: String,
    pub device_id: String,
    pub client_ip: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Handshake input violation → HTTP 400.
    #[error("missing token")]
    MissingToken,
    /// Handshake input violation → HTTP 400.
    #[error("missing device_id")]
    MissingDeviceId,
    /// Any authentication failure → HTTP 401. The cause is logged, never
    /// surfaced to the client.
    #[error("invalid token")]
    InvalidToken,
}

/// Lookup into the external credential store.
///
/// Deployment contract: the key `auth:at:{user_uuid}:{device_id}` holds
/// the MD5 hex of the token issued to that device, written by the account
/// service at login and removed at logout.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn stored_token_hash(
        &self,
        user_uuid: &str,
        device_id: &str,
    ) -> anyhow::Result<Option<String>>;
}

pub struct Authenticator {
    decoder: Arc<dyn TokenDecoder>,
    store: Option<Arc<dyn CredentialStore>>,
    metrics: Arc<Metrics>,
}

impl Authenticator {
    pub fn new(
        decoder: Arc<dyn TokenDecoder>,
        store: Option<Arc<dyn CredentialStore>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            decoder,
            store,
            metrics,
        }
    }

    /// Validate the handshake credentials and produce the [`Session`].
    ///
    /// When the credential store errors (connectivity, timeout) the check
    /// is skipped — fail-open — trading instant-kick strictness for
    /// availability. Every such skip is logged at warn so operators can
    /// alert on prolonged degraded mode.
    pub async fn authenticate(
        &self,
        token: &str,
        device_id: &str,
        client_ip: &str,
    ) -> Result<Session, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(AuthError::MissingDeviceId);
        }

        let claims = self.decoder.decode(token).map_err(|e| {
            debug!(device = %device_id, err = %e, "token rejected");
            AuthError::InvalidToken
        })?;

        if claims.device_id != device_id {
            debug!(
                user = %claims.user_uuid,
                claimed = %claims.device_id,
                presented = %device_id,
                "device_id does not match token claims"
            );
            return Err(AuthError::InvalidToken);
        }

        if let Some(store) = &self.store {
            match store.stored_token_hash(&claims.user_uuid, device_id).await {
                Ok(Some(stored)) => {
                    if !stored.eq_ignore_ascii_case(&md5_hex(token)) {
                        debug!(
                            user = %claims.user_uuid,
                            device = %device_id,
                            "stored credential hash mismatch — token superseded or revoked"
                        );
                        return Err(AuthError::InvalidToken);
                    }
                }
                Ok(None) => {
                    debug!(
                        user = %claims.user_uuid,
                        device = %device_id,
                        "no stored credential for device"
                    );
                    return Err(AuthError::InvalidToken);
                }
                Err(e) => {
                    self.metrics.auth_fail_open.inc();
                    warn!(
                        user = %claims.user_uuid,
                        device = %device_id,
                        err = %e,
                        "credential store unavailable — failing open to token-only validation"
                    );
                }
            }
        }

        Ok(Session {
            user_uuid: claims.user_uuid,
            device_id: device_id.to_string(),
            client_ip: client_ip.to_string(),
        })
    }
}

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
