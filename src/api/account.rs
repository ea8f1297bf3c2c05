//! Entitlements, Cross-App Tokens, and Sharing Endpoints

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::models::{AppId, Entitlements, Invitation, ShareRole, SharedAccess};

pub async fn get_entitlements(
    Extension(ctx): Extension<AuthContext>,
) -> Json<Entitlements> {
    Json(ctx.entitlements)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossAppTokenBody {
    pub target_app: String,
}

#[derive(Debug, Serialize)]
pub struct CrossAppTokenResponse {
    pub token: String,
}

pub async fn mint_cross_app_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CrossAppTokenBody>,
) -> Result<Json<CrossAppTokenResponse>, ApiError> {
    let app = AppId::parse(&body.target_app).ok_or_else(|| {
        ApiError::InvalidRequest(format!("unknown app: {}", body.target_app))
    })?;
    let token = state.sso.mint(&ctx.uid, app, &ctx.entitlements)?;
    Ok(Json(CrossAppTokenResponse { token }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareListing {
    pub shares: Vec<SharedAccess>,
    pub invitations: Vec<Invitation>,
}

pub async fn list_shares(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<ShareListing>, ApiError> {
    let shares = state.sharing.shares_for(&ctx.uid).await?;
    let invitations = state.sharing.invitations_from(&ctx.uid).await?;
    Ok(Json(ShareListing {
        shares,
        invitations,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareBody {
    pub to_email: String,
    pub resource_type: String,
    pub resource_id: String,
    pub role: ShareRole,
    pub app_id: AppId,
}

pub async fn create_share(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateShareBody>,
) -> Result<Json<Invitation>, ApiError> {
    if body.to_email.trim().is_empty() || !body.to_email.contains('@') {
        return Err(ApiError::InvalidRequest("toEmail must be an email".into()));
    }
    ctx.ensure_app(body.app_id)?;
    let invitation = state
        .sharing
        .create_invitation(
            &ctx.uid,
            &body.to_email,
            &body.resource_type,
            &body.resource_id,
            body.role,
            body.app_id,
        )
        .await?;
    Ok(Json(invitation))
}

pub async fn accept_invitation(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<SharedAccess>, ApiError> {
    let share = state.sharing.accept(&id, &ctx.uid, &ctx.email).await?;
    Ok(Json(share))
}

pub async fn decline_invitation(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Invitation>, ApiError> {
    let invitation = state.sharing.decline(&id, &ctx.email).await?;
    Ok(Json(invitation))
}

pub async fn revoke_share(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sharing.revoke(&id, &ctx.uid).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
