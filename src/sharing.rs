//! Sharing and Invitations
//!
//! Invitation lifecycle: created pending, then accepted, declined, or
//! expired. Acceptance is terminal and creates the shared-access grant.
//! Expiry is computed lazily at inspection time and persisted via
//! transition.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AppId, Invitation, InvitationStatus, ShareRole, SharedAccess};
use crate::store::{get_doc, put_doc, run_transaction, DocumentStore, StoreError};

pub const INVITATIONS: &str = "invitations";
pub const SHARED_ACCESS: &str = "shared_access";

pub struct SharingService {
    store: Arc<dyn DocumentStore>,
    invitation_ttl: ChronoDuration,
}

impl SharingService {
    pub fn new(store: Arc<dyn DocumentStore>, invitation_ttl_days: i64) -> Self {
        Self {
            store,
            invitation_ttl: ChronoDuration::days(invitation_ttl_days),
        }
    }

    pub async fn create_invitation(
        &self,
        owner_uid: &str,
        to_email: &str,
        resource_type: &str,
        resource_id: &str,
        role: ShareRole,
        app_id: AppId,
    ) -> Result<Invitation, ApiError> {
        if role == ShareRole::Owner {
            return Err(ApiError::InvalidRequest(
                "ownership cannot be granted by invitation".to_string(),
            ));
        }
        let now = Utc::now();
        let invitation = Invitation {
            id: Uuid::new_v4().to_string(),
            owner_uid: owner_uid.to_string(),
            to_email: to_email.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            role,
            app_id,
            status: InvitationStatus::Pending,
            created_at: now,
            expires_at: now + self.invitation_ttl,
        };
        put_doc(self.store.as_ref(), INVITATIONS, &invitation.id, &invitation).await?;
        Ok(invitation)
    }

    /// Read one invitation, persisting the expired transition when a
    /// pending invitation has lapsed.
    pub async fn get_invitation(&self, id: &str) -> Result<Option<Invitation>, ApiError> {
        let Some(invitation) = get_doc::<Invitation>(self.store.as_ref(), INVITATIONS, id).await?
        else {
            return Ok(None);
        };
        if invitation.is_lapsed(Utc::now()) {
            let expired = self
                .transition(id, |inv| {
                    if inv.is_lapsed(Utc::now()) {
                        inv.status = InvitationStatus::Expired;
                    }
                    Ok(())
                })
                .await?;
            return Ok(Some(expired));
        }
        Ok(Some(invitation))
    }

    /// Accept a pending invitation addressed to the caller and create the
    /// grant.
    pub async fn accept(
        &self,
        id: &str,
        accepting_uid: &str,
        accepting_email: &str,
    ) -> Result<SharedAccess, ApiError> {
        let email = accepting_email.to_string();
        let invitation = self
            .transition(id, move |inv| {
                if inv.is_lapsed(Utc::now()) {
                    inv.status = InvitationStatus::Expired;
                }
                if inv.status != InvitationStatus::Pending {
                    return Err(ApiError::InvalidRequest(
                        "invitation is no longer pending".to_string(),
                    ));
                }
                if !inv.to_email.eq_ignore_ascii_case(&email) {
                    return Err(ApiError::PermissionDenied);
                }
                inv.status = InvitationStatus::Accepted;
                Ok(())
            })
            .await?;

        let share = SharedAccess {
            id: Uuid::new_v4().to_string(),
            owner_uid: invitation.owner_uid.clone(),
            shared_with_uid: accepting_uid.to_string(),
            resource_type: invitation.resource_type.clone(),
            resource_id: invitation.resource_id.clone(),
            role: invitation.role,
            app_id: invitation.app_id,
            created_at: Utc::now(),
        };
        put_doc(self.store.as_ref(), SHARED_ACCESS, &share.id, &share).await?;
        Ok(share)
    }

    pub async fn decline(
        &self,
        id: &str,
        declining_email: &str,
    ) -> Result<Invitation, ApiError> {
        let email = declining_email.to_string();
        self.transition(id, move |inv| {
            if inv.is_lapsed(Utc::now()) {
                inv.status = InvitationStatus::Expired;
            }
            if inv.status != InvitationStatus::Pending {
                return Err(ApiError::InvalidRequest(
                    "invitation is no longer pending".to_string(),
                ));
            }
            if !inv.to_email.eq_ignore_ascii_case(&email) {
                return Err(ApiError::PermissionDenied);
            }
            inv.status = InvitationStatus::Declined;
            Ok(())
        })
        .await
    }

    /// Grants where the caller is owner or grantee.
    pub async fn shares_for(&self, uid: &str) -> Result<Vec<SharedAccess>, ApiError> {
        let mut shares = Vec::new();
        for doc in self.store.scan(SHARED_ACCESS).await? {
            if let Ok(share) = serde_json::from_value::<SharedAccess>(doc.data) {
                if share.owner_uid == uid || share.shared_with_uid == uid {
                    shares.push(share);
                }
            }
        }
        shares.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(shares)
    }

    /// Open invitations created by the caller.
    pub async fn invitations_from(&self, uid: &str) -> Result<Vec<Invitation>, ApiError> {
        let mut invitations = Vec::new();
        for doc in self.store.scan(INVITATIONS).await? {
            if let Ok(invitation) = serde_json::from_value::<Invitation>(doc.data) {
                if invitation.owner_uid == uid {
                    invitations.push(invitation);
                }
            }
        }
        invitations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(invitations)
    }

    /// Destroy a grant. Owner or grantee only.
    pub async fn revoke(&self, share_id: &str, uid: &str) -> Result<(), ApiError> {
        let Some(share) =
            get_doc::<SharedAccess>(self.store.as_ref(), SHARED_ACCESS, share_id).await?
        else {
            return Err(ApiError::InvalidRequest("no such share".to_string()));
        };
        if share.owner_uid != uid && share.shared_with_uid != uid {
            return Err(ApiError::PermissionDenied);
        }
        self.store.delete(SHARED_ACCESS, share_id).await?;
        Ok(())
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<Invitation, ApiError>
    where
        F: Fn(&mut Invitation) -> Result<(), ApiError>,
    {
        run_transaction::<Invitation, ApiError, _>(
            self.store.as_ref(),
            INVITATIONS,
            id,
            |existing| {
                let value = existing
                    .ok_or_else(|| ApiError::InvalidRequest("no such invitation".to_string()))?;
                let mut invitation: Invitation =
                    serde_json::from_value(value).map_err(StoreError::from)?;
                apply(&mut invitation)?;
                Ok((
                    serde_json::to_value(&invitation).map_err(StoreError::from)?,
                    invitation,
                ))
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service(store: Arc<MemoryStore>) -> SharingService {
        SharingService::new(store, 14)
    }

    async fn invite(service: &SharingService) -> Invitation {
        service
            .create_invitation(
                "owner",
                "friend@example.com",
                "meal_plan",
                "plan-1",
                ShareRole::Viewer,
                AppId::Nutrition,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn accept_creates_a_grant_and_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let invitation = invite(&service).await;

        let share = service
            .accept(&invitation.id, "friend", "friend@example.com")
            .await
            .unwrap();
        assert_eq!(share.owner_uid, "owner");
        assert_eq!(share.shared_with_uid, "friend");
        assert_eq!(share.role, ShareRole::Viewer);

        // A second accept hits the terminal state.
        let err = service
            .accept(&invitation.id, "friend", "friend@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn only_the_invitee_may_accept() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        let invitation = invite(&service).await;

        let err = service
            .accept(&invitation.id, "mallory", "mallory@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::PermissionDenied));
    }

    #[tokio::test]
    async fn declined_invitations_cannot_be_accepted() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        let invitation = invite(&service).await;

        service
            .decline(&invitation.id, "friend@example.com")
            .await
            .unwrap();
        let err = service
            .accept(&invitation.id, "friend", "friend@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn lapsed_invitations_expire_lazily_on_read() {
        let store = Arc::new(MemoryStore::new());
        let service = SharingService::new(store.clone(), -1);
        let invitation = invite(&service).await;

        let read = service.get_invitation(&invitation.id).await.unwrap().unwrap();
        assert_eq!(read.status, InvitationStatus::Expired);

        // The transition was persisted, not just computed.
        let stored = get_doc::<Invitation>(store.as_ref(), INVITATIONS, &invitation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, InvitationStatus::Expired);
    }

    #[tokio::test]
    async fn owner_or_grantee_may_revoke_a_share() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        let invitation = invite(&service).await;
        let share = service
            .accept(&invitation.id, "friend", "friend@example.com")
            .await
            .unwrap();

        assert!(matches!(
            service.revoke(&share.id, "mallory").await.unwrap_err(),
            ApiError::PermissionDenied
        ));
        service.revoke(&share.id, "owner").await.unwrap();
        assert!(service.shares_for("friend").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_role_cannot_be_granted() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        let err = service
            .create_invitation(
                "owner",
                "x@example.com",
                "meal_plan",
                "p1",
                ShareRole::Owner,
                AppId::Nutrition,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }
}
