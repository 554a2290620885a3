//! Real-time delivery plus push to registered devices.
//!
//! Push runs after the real-time frames and never fails the operation that
//! triggered it: provider errors are logged, rejected tokens are pruned.

use std::sync::Arc;

use tracing::{debug, warn};

use soiree_shared::constants::{PUSH_BATCH_SIZE, PUSH_BODY_MAX_CHARS};
use soiree_shared::protocol::ServerFrame;
use soiree_shared::UserId;

use crate::hub::Realtime;
use crate::presence::PresenceView;
use crate::push::{PushNotification, PushSink};
use crate::rooms::Room;
use crate::storage::{Deadline, Storage};

#[derive(Clone)]
pub struct NotificationFanout {
    realtime: Arc<dyn Realtime>,
    presence: Arc<dyn PresenceView>,
    storage: Storage,
    push: Arc<dyn PushSink>,
}

impl NotificationFanout {
    pub fn new(
        realtime: Arc<dyn Realtime>,
        presence: Arc<dyn PresenceView>,
        storage: Storage,
        push: Arc<dyn PushSink>,
    ) -> Self {
        Self {
            realtime,
            presence,
            storage,
            push,
        }
    }

    pub async fn to_user(&self, user: &UserId, frame: &ServerFrame) {
        self.realtime.send_to_users(std::slice::from_ref(user), frame).await;
    }

    pub async fn to_users(&self, users: &[UserId], frame: &ServerFrame) {
        if users.is_empty() {
            return;
        }
        self.realtime.send_to_users(users, frame).await;
    }

    pub async fn to_room(&self, room: Room, frame: &ServerFrame, exclude: Option<&UserId>) {
        self.realtime.send_to_room(room, frame, exclude).await;
    }

    /// Detach `user` from a room they no longer belong to.
    pub async fn drop_from_room(&self, room: Room, user: &UserId) {
        self.realtime.leave_room(room, user).await;
    }

    /// Push `notification` to every device of `recipients`.
    pub async fn push(&self, recipients: &[UserId], notification: &PushNotification) {
        if recipients.is_empty() {
            return;
        }

        let tokens = match self
            .storage
            .run(Deadline::List, |db| Ok(db.push_tokens_for_users(recipients)?))
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "push token lookup failed");
                return;
            }
        };
        if tokens.is_empty() {
            debug!(recipients = recipients.len(), "no push tokens registered");
            return;
        }

        let mut rejected = Vec::new();
        for batch in tokens.chunks(PUSH_BATCH_SIZE) {
            match self.push.send_to_all(batch, notification).await {
                Ok(report) => {
                    debug!(
                        sent = report.success_count,
                        failed = report.failure_count,
                        "push batch delivered"
                    );
                    rejected.extend(report.failed_tokens);
                }
                Err(e) => warn!(error = %e, tokens = batch.len(), "push batch failed"),
            }
        }

        if !rejected.is_empty() {
            match self
                .storage
                .run(Deadline::Point, |db| Ok(db.delete_push_tokens(&rejected)?))
                .await
            {
                Ok(pruned) => debug!(pruned, "pruned rejected push tokens"),
                Err(e) => warn!(error = %e, "failed to prune push tokens"),
            }
        }
    }

    /// Push only to the recipients without a live presence.
    pub async fn push_if_offline(&self, recipients: &[UserId], notification: &PushNotification) {
        let mut offline = Vec::with_capacity(recipients.len());
        for user in recipients {
            if !self.presence.is_online(user).await {
                offline.push(user.clone());
            }
        }
        self.push(&offline, notification).await;
    }
}

/// Cut a push body to the display limit, ending in `...` when shortened.
pub fn truncate_body(text: &str) -> String {
    if text.chars().count() <= PUSH_BODY_MAX_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PUSH_BODY_MAX_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use chrono::Utc;
    use soiree_store::PushToken;

    fn token(user: &UserId, value: &str) -> PushToken {
        PushToken {
            token: value.into(),
            user_id: user.clone(),
            device: None,
            user_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bodies_are_truncated_on_char_boundaries() {
        assert_eq!(truncate_body("court"), "court");
        let exact = "é".repeat(PUSH_BODY_MAX_CHARS);
        assert_eq!(truncate_body(&exact), exact);

        let long = "é".repeat(PUSH_BODY_MAX_CHARS + 1);
        let cut = truncate_body(&long);
        assert_eq!(cut.chars().count(), PUSH_BODY_MAX_CHARS);
        assert!(cut.ends_with("..."));
    }

    #[tokio::test]
    async fn push_reaches_tokens_and_prunes_rejected() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let tokens = [token(&a, "good"), token(&a, "dead")];
        env.storage
            .run(Deadline::Point, move |db| {
                for t in &tokens {
                    db.upsert_push_token(t)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        env.push.reject("dead");

        env.fanout.push(&[a.clone()], &PushNotification::new("t", "b")).await;

        let sent = env.push.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.len(), 3);

        let left = env
            .storage
            .run(Deadline::Point, move |db| Ok(db.push_tokens_for_users(&[a])?))
            .await
            .unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"good".to_string()));
        assert!(!left.contains(&"dead".to_string()));
    }

    #[tokio::test]
    async fn large_pushes_are_batched_and_pruned_per_batch() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        // `a` already owns one device, so this brings them to one full batch.
        let tokens: Vec<PushToken> = (0..PUSH_BATCH_SIZE - 1).map(|i| token(&a, &format!("t{i:03}"))).collect();
        env.storage
            .run(Deadline::List, move |db| {
                for t in &tokens {
                    db.upsert_push_token(t)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        env.push.reject("t042");
        env.push.reject("device:b@x.com");

        let recipients = [a, b];
        env.fanout.push(&recipients, &PushNotification::new("t", "b")).await;

        let sent = env.push.sent();
        let sizes: Vec<usize> = sent.iter().map(|(batch, _)| batch.len()).collect();
        assert_eq!(sizes, vec![PUSH_BATCH_SIZE, 1]);
        assert_eq!(sent[1].0, vec!["device:b@x.com".to_string()]);

        let left = env
            .storage
            .run(Deadline::List, move |db| Ok(db.push_tokens_for_users(&recipients)?))
            .await
            .unwrap();
        assert_eq!(left.len(), PUSH_BATCH_SIZE - 1);
        assert!(!left.contains(&"t042".to_string()));
        assert!(!left.contains(&"device:b@x.com".to_string()));
    }

    #[tokio::test]
    async fn online_users_are_not_pushed() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        for (u, t) in [(&a, "ta"), (&b, "tb")] {
            let t = token(u, t);
            env.storage
                .run(Deadline::Point, move |db| Ok(db.upsert_push_token(&t)?))
                .await
                .unwrap();
        }
        let _session = env.connect(&a).await;

        env.fanout
            .push_if_offline(&[a, b], &PushNotification::new("t", "b"))
            .await;

        let sent = env.push.sent();
        assert_eq!(sent.len(), 1);
        let mut tokens = sent[0].0.clone();
        tokens.sort();
        assert_eq!(tokens, vec!["device:b@x.com".to_string(), "tb".to_string()]);
    }

    #[tokio::test]
    async fn push_without_recipients_is_a_noop() {
        let env = TestEnv::new().await;
        env.fanout.push(&[], &PushNotification::new("t", "b")).await;
        assert!(env.push.sent().is_empty());
    }
}
