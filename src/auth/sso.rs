//! Cross-App SSO Tokens
//!
//! Short-lived HMAC-SHA256 compact tokens carrying `(uid, targetApp, iat,
//! exp)`. Minting asserts the caller's access to the target app; tokens are
//! never stored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::SsoConfig;
use crate::error::ApiError;
use crate::models::{AppId, Entitlements};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SsoError {
    #[error("invalid_token")]
    InvalidToken,
}

/// Signed token claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrossAppClaims {
    pub uid: String,
    pub target_app: AppId,
    pub iat: i64,
    pub exp: i64,
}

pub struct SsoSigner {
    config: SsoConfig,
}

impl SsoSigner {
    pub fn new(config: SsoConfig) -> Self {
        Self { config }
    }

    /// Mint a token for the target app. Fails when the caller's plan does
    /// not include it.
    pub fn mint(
        &self,
        uid: &str,
        target_app: AppId,
        entitlements: &Entitlements,
    ) -> Result<String, ApiError> {
        if !entitlements.has_app_access(target_app) {
            return Err(ApiError::UpgradeRequired(format!(
                "no access to the {target_app} app"
            )));
        }
        let iat = Utc::now().timestamp();
        let claims = CrossAppClaims {
            uid: uid.to_string(),
            target_app,
            iat,
            exp: iat + self.config.ttl_secs,
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).map_err(|e| {
            ApiError::Internal(e.into())
        })?);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        Ok(format!("{payload}.{signature}"))
    }

    /// Check signature then expiry; returns the claims.
    pub fn verify(&self, token: &str) -> Result<CrossAppClaims, SsoError> {
        let (payload, signature) = token.split_once('.').ok_or(SsoError::InvalidToken)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SsoError::InvalidToken)?;

        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|_| SsoError::InvalidToken)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| SsoError::InvalidToken)?;

        let claims: CrossAppClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(SsoError::InvalidToken)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(SsoError::InvalidToken);
        }
        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
