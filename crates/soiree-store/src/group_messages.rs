use rusqlite::{params, Connection, OptionalExtension};

use soiree_shared::ObjectId;

use crate::columns::{get_enum, get_id, get_ts, get_user, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::GroupMessage;

const MESSAGE_COLUMNS: &str = "id, group_id, sender_id, content, message_type, created_at";

impl Database {
    /// Persist a message and bump the group's `updated_at`.
    pub fn insert_group_message(&self, message: &GroupMessage) -> Result<()> {
        let tx = self.begin()?;
        insert_group_message(&tx, message)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_group_message(&self, id: ObjectId) -> Result<GroupMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM chat_group_messages WHERE id = ?1"),
                params![id.to_hex()],
                row_to_message,
            )
            .map_err(StoreError::from_query)
    }

    /// Up to `limit` messages with `id < before` (or the newest), returned
    /// in chronological order.
    pub fn list_group_messages(
        &self,
        group_id: ObjectId,
        limit: u32,
        before: Option<ObjectId>,
    ) -> Result<Vec<GroupMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_group_messages
             WHERE group_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![group_id.to_hex(), before.map(|b| b.to_hex()), limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn latest_group_message(&self, group_id: ObjectId) -> Result<Option<GroupMessage>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM chat_group_messages
                     WHERE group_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![group_id.to_hex()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn count_group_messages(&self, group_id: ObjectId) -> Result<u64> {
        self.count_group_messages_after(group_id, None)
    }

    /// Messages with `id > after`, or all messages when `after` is `None`.
    pub fn count_group_messages_after(
        &self,
        group_id: ObjectId,
        after: Option<ObjectId>,
    ) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM chat_group_messages
             WHERE group_id = ?1 AND (?2 IS NULL OR id > ?2)",
            params![group_id.to_hex(), after.map(|a| a.to_hex())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

pub(crate) fn insert_group_message(conn: &Connection, message: &GroupMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_group_messages (id, group_id, sender_id, content, message_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.id.to_hex(),
            message.group_id.to_hex(),
            message.sender_id.as_str(),
            message.content,
            message.kind.as_str(),
            ts(&message.created_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, "message references an unknown group"))?;
    conn.execute(
        "UPDATE chat_groups SET updated_at = ?2 WHERE id = ?1",
        params![message.group_id.to_hex(), ts(&message.created_at)],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMessage> {
    Ok(GroupMessage {
        id: get_id(row, 0)?,
        group_id: get_id(row, 1)?,
        sender_id: get_user(row, 2)?,
        content: row.get(3)?,
        kind: get_enum(row, 4)?,
        created_at: get_ts(row, 5)?,
    })
}
