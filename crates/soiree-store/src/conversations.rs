use rusqlite::{params, Connection};

use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_enum, get_id, get_opt_ts, get_ts, get_user, opt_ts, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::DirectConversation;

const CONVERSATION_COLUMNS: &str =
    "id, user_a, user_b, status, created_by, created_at, updated_at, last_message_at";

impl Database {
    pub fn insert_conversation(&self, conversation: &DirectConversation) -> Result<()> {
        insert_conversation(self.conn(), conversation)
    }

    pub fn get_conversation(&self, id: ObjectId) -> Result<DirectConversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_hex()],
                row_to_conversation,
            )
            .map_err(StoreError::from_query)
    }

    /// Accepted or active conversations of `user`, most recent activity
    /// first.
    pub fn list_conversations_for(&self, user: &UserId) -> Result<Vec<DirectConversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE (user_a = ?1 OR user_b = ?1)
               AND status IN ('accepted', 'active')
             ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}

pub(crate) fn insert_conversation(conn: &Connection, conversation: &DirectConversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations
             (id, user_a, user_b, status, created_by, created_at, updated_at, last_message_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conversation.id.to_hex(),
            conversation.user_a.as_str(),
            conversation.user_b.as_str(),
            conversation.status.as_str(),
            conversation.created_by.as_str(),
            ts(&conversation.created_at),
            ts(&conversation.updated_at),
            opt_ts(&conversation.last_message_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, "invalid conversation"))?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectConversation> {
    Ok(DirectConversation {
        id: get_id(row, 0)?,
        user_a: get_user(row, 1)?,
        user_b: get_user(row, 2)?,
        status: get_enum(row, 3)?,
        created_by: get_user(row, 4)?,
        created_at: get_ts(row, 5)?,
        updated_at: get_ts(row, 6)?,
        last_message_at: get_opt_ts(row, 7)?,
    })
}
