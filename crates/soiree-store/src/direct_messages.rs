use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_enum, get_id, get_ts, get_user, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{DirectMessage, MessageRead};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, kind, is_read, created_at";

impl Database {
    /// Persist a message and bump the conversation's `last_message_at`.
    pub fn insert_direct_message(&self, message: &DirectMessage) -> Result<()> {
        let tx = self.begin()?;
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, kind, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_hex(),
                message.conversation_id.to_hex(),
                message.sender_id.as_str(),
                message.content,
                message.kind.as_str(),
                message.is_read,
                ts(&message.created_at),
            ],
        )
        .map_err(|e| StoreError::from_write(e, "message references an unknown conversation"))?;
        tx.execute(
            "UPDATE conversations SET last_message_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![message.conversation_id.to_hex(), ts(&message.created_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_direct_message(&self, id: ObjectId) -> Result<DirectMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_hex()],
                row_to_message,
            )
            .map_err(StoreError::from_query)
    }

    /// The newest `limit` messages older than `before` (or the newest
    /// overall), returned oldest first.
    pub fn list_direct_messages(
        &self,
        conversation_id: ObjectId,
        limit: u32,
        before: Option<ObjectId>,
    ) -> Result<Vec<DirectMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.to_hex(), before.map(|b| b.to_hex()), limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn last_direct_message(&self, conversation_id: ObjectId) -> Result<Option<DirectMessage>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![conversation_id.to_hex()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Add `(user, at)` to the message's read set. Returns `false` when the
    /// user had already read it.
    pub fn mark_direct_message_read(
        &self,
        message_id: ObjectId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![message_id.to_hex(), user.as_str(), ts(&at)],
        )?;
        tx.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1",
            params![message_id.to_hex()],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Read marks of one message, earliest first.
    pub fn direct_message_reads(&self, message_id: ObjectId) -> Result<Vec<MessageRead>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, user_id, read_at FROM message_reads
             WHERE message_id = ?1 ORDER BY read_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_hex()], |row| {
            Ok(MessageRead {
                message_id: get_id(row, 0)?,
                user_id: get_user(row, 1)?,
                read_at: get_ts(row, 2)?,
            })
        })?;

        let mut reads = Vec::new();
        for row in rows {
            reads.push(row?);
        }
        Ok(reads)
    }

    /// Messages not sent by `user` and absent from `user`'s read marks.
    pub fn count_unread_direct(&self, conversation_id: ObjectId, user: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.sender_id <> ?2
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )",
            params![conversation_id.to_hex(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Mark every unread incoming message of the conversation as read by
    /// `user`. Returns the messages that were newly marked.
    pub fn mark_conversation_read(
        &self,
        conversation_id: ObjectId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<DirectMessage>> {
        let tx = self.begin()?;
        let unread = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.conversation_id = ?1
                   AND m.sender_id <> ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM message_reads r
                       WHERE r.message_id = m.id AND r.user_id = ?2
                   )
                 ORDER BY m.id ASC"
            ))?;
            let rows = stmt.query_map(
                params![conversation_id.to_hex(), user.as_str()],
                row_to_message,
            )?;
            let mut unread = Vec::new();
            for row in rows {
                unread.push(row?);
            }
            unread
        };

        for message in &unread {
            tx.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                params![message.id.to_hex(), user.as_str(), ts(&at)],
            )?;
            tx.execute(
                "UPDATE messages SET is_read = 1 WHERE id = ?1",
                params![message.id.to_hex()],
            )?;
        }
        tx.commit()?;
        Ok(unread)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: get_id(row, 0)?,
        conversation_id: get_id(row, 1)?,
        sender_id: get_user(row, 2)?,
        content: row.get(3)?,
        kind: get_enum(row, 4)?,
        is_read: row.get(5)?,
        created_at: get_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{add_user, temp_db};
    use crate::models::DirectConversation;
    use soiree_shared::types::{ConversationStatus, MessageKind};

    fn setup(db: &Database) -> (UserId, UserId, DirectConversation) {
        let a = add_user(db, "a@x.com", "A", true);
        let b = add_user(db, "b@x.com", "B", true);
        let conv = DirectConversation {
            id: ObjectId::new(),
            user_a: a.clone(),
            user_b: b.clone(),
            status: ConversationStatus::Accepted,
            created_by: a.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_message_at: None,
        };
        db.insert_conversation(&conv).unwrap();
        (a, b, conv)
    }

    fn send(db: &Database, conv: &DirectConversation, from: &UserId, text: &str) -> DirectMessage {
        let message = DirectMessage {
            id: ObjectId::new(),
            conversation_id: conv.id,
            sender_id: from.clone(),
            content: text.into(),
            kind: MessageKind::Text,
            is_read: false,
            created_at: Utc::now(),
        };
        db.insert_direct_message(&message).unwrap();
        message
    }

    #[test]
    fn insert_updates_last_message_at() {
        let (_dir, db) = temp_db();
        let (a, _b, conv) = setup(&db);
        let message = send(&db, &conv, &a, "hello");

        let stored = db.get_conversation(conv.id).unwrap();
        assert_eq!(
            stored.last_message_at.unwrap().timestamp_micros(),
            message.created_at.timestamp_micros()
        );
        assert_eq!(db.last_direct_message(conv.id).unwrap().unwrap().id, message.id);
    }

    #[test]
    fn message_for_unknown_conversation_is_rejected() {
        let (_dir, db) = temp_db();
        let (a, _b, mut conv) = setup(&db);
        conv.id = ObjectId::new();
        let message = DirectMessage {
            id: ObjectId::new(),
            conversation_id: conv.id,
            sender_id: a,
            content: "x".into(),
            kind: MessageKind::Text,
            is_read: false,
            created_at: Utc::now(),
        };
        assert!(db.insert_direct_message(&message).is_err());
    }

    #[test]
    fn pages_newest_first_returned_ascending() {
        let (_dir, db) = temp_db();
        let (a, _b, conv) = setup(&db);
        let sent: Vec<DirectMessage> = (0..5).map(|i| send(&db, &conv, &a, &format!("m{i}"))).collect();

        let page = db.list_direct_messages(conv.id, 3, None).unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let older = db.list_direct_messages(conv.id, 3, Some(sent[2].id)).unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1"]);
    }

    #[test]
    fn read_marks_have_set_semantics() {
        let (_dir, db) = temp_db();
        let (a, b, conv) = setup(&db);
        let message = send(&db, &conv, &a, "hello");

        assert_eq!(db.count_unread_direct(conv.id, &b).unwrap(), 1);
        assert_eq!(db.count_unread_direct(conv.id, &a).unwrap(), 0);

        assert!(db.mark_direct_message_read(message.id, &b, Utc::now()).unwrap());
        assert!(!db.mark_direct_message_read(message.id, &b, Utc::now()).unwrap());

        let reads = db.direct_message_reads(message.id).unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].user_id, b);
        assert!(db.get_direct_message(message.id).unwrap().is_read);
        assert_eq!(db.count_unread_direct(conv.id, &b).unwrap(), 0);
    }

    #[test]
    fn mark_conversation_read_returns_newly_read() {
        let (_dir, db) = temp_db();
        let (a, b, conv) = setup(&db);
        send(&db, &conv, &a, "one");
        send(&db, &conv, &a, "two");
        send(&db, &conv, &b, "mine");

        let marked = db.mark_conversation_read(conv.id, &b, Utc::now()).unwrap();
        assert_eq!(marked.len(), 2);
        assert!(marked.iter().all(|m| m.sender_id == a));
        assert!(db.mark_conversation_read(conv.id, &b, Utc::now()).unwrap().is_empty());
        assert_eq!(db.count_unread_direct(conv.id, &a).unwrap(), 1);
    }
}
