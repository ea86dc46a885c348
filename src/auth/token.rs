//! Compact HS256 token verification for the handshake.
//!
//! Tokens are standard three-part JWTs signed with a shared secret. Only
//! verification lives here — issuance belongs to the account service.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm {0:?}")]
    Algorithm(String),
    #[error("signature mismatch")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("missing claim {0}")]
    MissingClaim(&'static str),
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// The claims the gateway cares about. Unknown claims are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_uuid: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub exp: Option<i64>,
}

pub trait TokenDecoder: Send + Sync {
    fn decode(&self, token: &str) -> Result<Claims, TokenError>;
}

/// HS256 verification against a shared secret.
pub struct HsTokenDecoder {
    secret: Vec<u8>,
}

impl HsTokenDecoder {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenDecoder for HsTokenDecoder {
    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let (signing_input, sig_b64) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
        let (header_b64, claims_b64) = signing_input
            .split_once('.')
            .ok_or(TokenError::Malformed)?;
        if claims_b64.contains('.') {
            return Err(TokenError::Malformed);
        }

        let header_raw = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_raw).map_err(|_| TokenError::Malformed)?;
        if header.alg != "HS256" {
            return Err(TokenError::Algorithm(header.alg));
        }

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Signature)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::Signature)?;

        let claims_raw = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_raw).map_err(|_| TokenError::Malformed)?;

        if claims.user_uuid.is_empty() {
            return Err(TokenError::MissingClaim("user_uuid"));
        }
        if claims.device_id.is_empty() {
            return Err(TokenError::MissingClaim("device_id"));
        }
        if let Some(exp) = claims.exp {
            if exp < chrono::Utc::now().timestamp() {
                return Err(TokenError::Expired);
            }
        }
        Ok(claims)
    }
}
