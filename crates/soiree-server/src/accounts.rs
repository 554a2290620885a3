//! Platform admin rights and push device registration.

use chrono::Utc;
use tracing::info;

use soiree_shared::protocol::ServerFrame;
use soiree_shared::UserId;
use soiree_store::PushToken;

use crate::auth::require_platform_admin;
use crate::error::{msg, on_missing, ChatError};
use crate::fanout::NotificationFanout;
use crate::storage::{Deadline, Storage};

#[derive(Clone)]
pub struct AccountService {
    storage: Storage,
    fanout: NotificationFanout,
}

impl AccountService {
    pub fn new(storage: Storage, fanout: NotificationFanout) -> Self {
        Self { storage, fanout }
    }

    /// Grant or revoke the admin flag of `target`. Returns whether it
    /// changed; only a change is announced to `target`.
    pub async fn set_admin_rights(&self, by: &UserId, target: &UserId, admin: bool) -> Result<bool, ChatError> {
        let changed = self
            .storage
            .run(Deadline::Point, |db| {
                require_platform_admin(db, by)?;
                db.set_user_admin(target, admin)
                    .map_err(on_missing(msg::USER_NOT_FOUND))
            })
            .await?;

        if changed {
            info!(by = %by, user = %target, admin, "admin rights changed");
            self.fanout
                .to_user(
                    target,
                    &ServerFrame::AdminRightsChanged {
                        user_email: target.clone(),
                        admin,
                        group_id: None,
                    },
                )
                .await;
        }
        Ok(changed)
    }

    /// Attach a device token to `user`, taking it over from any previous
    /// owner.
    pub async fn register_token(
        &self,
        user: &UserId,
        token: &str,
        device: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(), ChatError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::Validation(msg::TOKEN_REQUIRED));
        }
        let now = Utc::now();
        let record = PushToken {
            token: token.to_string(),
            user_id: user.clone(),
            device,
            user_agent,
            created_at: now,
            updated_at: now,
        };
        self.storage
            .run(Deadline::Point, |db| Ok(db.upsert_push_token(&record)?))
            .await?;
        info!(user = %user, "push token registered");
        Ok(())
    }

    /// Returns `false` when `user` had no such token.
    pub async fn unregister_token(&self, user: &UserId, token: &str) -> Result<bool, ChatError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::Validation(msg::TOKEN_REQUIRED));
        }
        self.storage
            .run(Deadline::Point, |db| Ok(db.delete_push_token(user, token)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::push::PushNotification;
    use crate::testing::TestEnv;

    #[tokio::test]
    async fn admin_rights_change_is_announced_once() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", true).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        let mut sb = env.connect(&b).await;

        assert!(env.accounts.set_admin_rights(&a, &b, true).await.unwrap());
        assert!(!env.accounts.set_admin_rights(&a, &b, true).await.unwrap());
        assert!(matches!(
            TestEnv::drain(&mut sb).as_slice(),
            [ServerFrame::AdminRightsChanged { admin: true, group_id: None, .. }]
        ));

        // b can now use admin-only operations.
        env.direct.search_admins(&b, "x.com", None).await.unwrap();
    }

    #[tokio::test]
    async fn only_admins_change_rights() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", true).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;

        let err = env.accounts.set_admin_rights(&b, &a, false).await.unwrap_err();
        assert!(matches!(err, ChatError::AdminOnly(_)));

        let ghost = UserId::parse("ghost@x.com").unwrap();
        let err = env.accounts.set_admin_rights(&a, &ghost, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn tokens_move_between_users() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;

        let err = env.accounts.register_token(&a, " ", None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        env.accounts
            .register_token(&a, "shared-phone", Some("android".into()), None)
            .await
            .unwrap();
        env.accounts.register_token(&b, "shared-phone", None, None).await.unwrap();
        assert!(!env.accounts.unregister_token(&a, "shared-phone").await.unwrap());

        env.fanout.push(&[b.clone()], &PushNotification::new("t", "b")).await;
        let sent = env.push.sent();
        assert!(sent[0].0.contains(&"shared-phone".to_string()));

        assert!(env.accounts.unregister_token(&b, "shared-phone").await.unwrap());
    }
}
