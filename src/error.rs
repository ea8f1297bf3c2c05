//! Caller-Visible Errors
//!
//! One error kind enum for the whole HTTP surface. Each kind maps to a fixed
//! status code and renders the standard envelope
//! `{error, message?, resetAt?, upgradeUrl?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid token")]
    Unauthorized,

    #[error("{0}")]
    UpgradeRequired(String),

    #[error("feature not available on current plan: {0}")]
    FeatureNotAvailable(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("admin privileges required")]
    InsufficientPrivileges,

    #[error("daily AI quota exceeded")]
    AiQuotaExceeded { reset_at: DateTime<Utc> },

    #[error("rate limit exceeded: {kind}")]
    RateLimitExceeded {
        kind: &'static str,
        reset_at: DateTime<Utc>,
    },

    #[error("monthly AI budget exhausted")]
    AiBudgetExhausted { reset_at: Option<DateTime<Utc>> },

    #[error("estimated request cost exceeds the per-call cap")]
    RequestTooExpensive,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("budget check failed")]
    BudgetCheckFailed,

    #[error("all providers failed: {0}")]
    ProviderError(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable kind for the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::UpgradeRequired(_) => "upgrade_required",
            ApiError::FeatureNotAvailable(_) => "feature_not_available",
            ApiError::PermissionDenied => "permission_denied",
            ApiError::InsufficientPrivileges => "insufficient_privileges",
            ApiError::AiQuotaExceeded { .. } => "ai_quota_exceeded",
            ApiError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ApiError::AiBudgetExhausted { .. } => "ai_budget_exhausted",
            ApiError::RequestTooExpensive => "request_too_expensive",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::BudgetCheckFailed => "budget_check_failed",
            ApiError::ProviderError(_) => "provider_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::UpgradeRequired(_)
            | ApiError::FeatureNotAvailable(_)
            | ApiError::PermissionDenied
            | ApiError::InsufficientPrivileges => StatusCode::FORBIDDEN,
            ApiError::AiQuotaExceeded { .. }
            | ApiError::RateLimitExceeded { .. }
            | ApiError::AiBudgetExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RequestTooExpensive => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::BudgetCheckFailed | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::ProviderError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ApiError::AiQuotaExceeded { reset_at } => Some(*reset_at),
            ApiError::RateLimitExceeded { reset_at, .. } => Some(*reset_at),
            ApiError::AiBudgetExhausted { reset_at } => *reset_at,
            _ => None,
        }
    }

    fn upgrade_url(&self) -> Option<String> {
        match self {
            ApiError::UpgradeRequired(_) | ApiError::AiBudgetExhausted { .. } => {
                Some("/pricing".to_string())
            }
            _ => None,
        }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

/// Standard error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "resetAt", skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(rename = "upgradeUrl", skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error surfaced to caller");
        }
        let envelope = ErrorEnvelope {
            error: self.kind(),
            message: Some(self.to_string()),
            reset_at: self.reset_at(),
            upgrade_url: self.upgrade_url(),
        };
        (self.status(), Json(envelope)).into_response()
    }
}
