//! Sharing Grants and Invitations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::AppId;

/// Role granted on a shared resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShareRole {
    Owner,
    Admin,
    Editor,
    Viewer,
}

/// Invitation lifecycle. Acceptance is terminal; only pending invitations
/// may be accepted or declined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

/// Co-owned access tuple, created when an invitation is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAccess {
    pub id: String,
    pub owner_uid: String,
    pub shared_with_uid: String,
    pub resource_type: String,
    pub resource_id: String,
    pub role: ShareRole,
    pub app_id: AppId,
    pub created_at: DateTime<Utc>,
}

/// Pending share offer. Expiry is computed lazily at inspection time and
/// persisted via transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub owner_uid: String,
    pub to_email: String,
    pub resource_type: String,
    pub resource_id: String,
    pub role: ShareRole,
    pub app_id: AppId,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    /// Whether a pending invitation has passed its expiry.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && now > self.expires_at
    }
}
