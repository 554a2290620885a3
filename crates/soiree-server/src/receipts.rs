//! Per-user read pointers for group chats.

use chrono::{DateTime, Utc};

use soiree_shared::protocol::ServerFrame;
use soiree_shared::{ObjectId, UserId};
use soiree_store::{Database, GroupReadReceipt};

use crate::error::ChatError;
use crate::fanout::NotificationFanout;
use crate::rooms::Room;
use crate::storage::{Deadline, Storage};

#[derive(Clone)]
pub struct ReadReceiptEngine {
    storage: Storage,
    fanout: NotificationFanout,
}

impl ReadReceiptEngine {
    pub fn new(storage: Storage, fanout: NotificationFanout) -> Self {
        Self { storage, fanout }
    }

    /// Move `user`'s pointer to the latest message of the group and tell the
    /// rest of the group room. Membership is the caller's concern.
    pub async fn mark_as_read(&self, group_id: ObjectId, user: &UserId) -> Result<DateTime<Utc>, ChatError> {
        let read_at = Utc::now();
        self.storage
            .run(Deadline::Point, |db| {
                let latest = db.latest_group_message(group_id)?;
                db.upsert_group_read_receipt(&GroupReadReceipt {
                    group_id,
                    user_id: user.clone(),
                    last_read_message_id: latest.map(|m| m.id),
                    last_read_at: read_at,
                })?;
                Ok(())
            })
            .await?;

        self.fanout
            .to_room(
                Room::Group(group_id),
                &ServerFrame::GroupMessagesRead {
                    group_id,
                    user_id: user.clone(),
                    read_at,
                },
                Some(user),
            )
            .await;
        Ok(read_at)
    }

    pub async fn unread_count(&self, group_id: ObjectId, user: &UserId) -> Result<u64, ChatError> {
        self.storage
            .run(Deadline::Point, |db| Ok(unread_in(db, group_id, user)?))
            .await
    }
}

/// Messages after `user`'s pointer; all of them when no pointer exists.
pub(crate) fn unread_in(db: &Database, group_id: ObjectId, user: &UserId) -> soiree_store::Result<u64> {
    match db.get_group_read_receipt(group_id, user)? {
        Some(receipt) => db.count_group_messages_after(group_id, receipt.last_read_message_id),
        None => db.count_group_messages(group_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    #[tokio::test]
    async fn pointer_moves_to_latest_and_room_is_told() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", true).await;
        let b = env.add_user("b@x.com", "Bruno", true).await;
        let group = env.add_group("Apéro", &a, &[&b]).await;
        env.post(group, &a, "un").await;
        env.post(group, &a, "deux").await;

        assert_eq!(env.receipts.unread_count(group, &b).await.unwrap(), 2);

        let mut sa = env.connect(&a).await;
        let mut sb = env.connect(&b).await;
        env.hub.join_room(Room::Group(group), &a).await;
        env.hub.join_room(Room::Group(group), &b).await;

        env.receipts.mark_as_read(group, &b).await.unwrap();
        assert_eq!(env.receipts.unread_count(group, &b).await.unwrap(), 0);

        let seen = TestEnv::drain(&mut sa);
        assert!(matches!(
            seen.as_slice(),
            [ServerFrame::GroupMessagesRead { user_id, .. }] if *user_id == b
        ));
        assert!(TestEnv::drain(&mut sb).is_empty());

        env.post(group, &a, "trois").await;
        assert_eq!(env.receipts.unread_count(group, &b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reading_an_empty_group_counts_later_messages() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", true).await;
        let group = env.add_group("Vide", &a, &[]).await;

        env.receipts.mark_as_read(group, &a).await.unwrap();
        env.post(group, &a, "premier").await;
        assert_eq!(env.receipts.unread_count(group, &a).await.unwrap(), 1);
    }
}
