use rusqlite::{params, OptionalExtension};

use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_id, get_opt_id, get_ts, get_user, ts};
use crate::database::Database;
use crate::error::Result;
use crate::models::GroupReadReceipt;

impl Database {
    /// Insert or advance the receipt of `(group, user)`.
    ///
    /// A `None` message id keeps the stored pointer; the pointer itself never
    /// moves backwards.
    pub fn upsert_group_read_receipt(&self, receipt: &GroupReadReceipt) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_group_read_receipts
                 (group_id, user_id, last_read_message_id, last_read_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (group_id, user_id) DO UPDATE SET
                 last_read_message_id = CASE
                     WHEN excluded.last_read_message_id IS NULL THEN last_read_message_id
                     WHEN last_read_message_id IS NULL THEN excluded.last_read_message_id
                     WHEN excluded.last_read_message_id > last_read_message_id
                         THEN excluded.last_read_message_id
                     ELSE last_read_message_id
                 END,
                 last_read_at = MAX(last_read_at, excluded.last_read_at)",
            params![
                receipt.group_id.to_hex(),
                receipt.user_id.as_str(),
                receipt.last_read_message_id.map(|id| id.to_hex()),
                ts(&receipt.last_read_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_group_read_receipt(
        &self,
        group_id: ObjectId,
        user: &UserId,
    ) -> Result<Option<GroupReadReceipt>> {
        let receipt = self
            .conn()
            .query_row(
                "SELECT group_id, user_id, last_read_message_id, last_read_at
                 FROM chat_group_read_receipts
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_hex(), user.as_str()],
                |row| {
                    Ok(GroupReadReceipt {
                        group_id: get_id(row, 0)?,
                        user_id: get_user(row, 1)?,
                        last_read_message_id: get_opt_id(row, 2)?,
                        last_read_at: get_ts(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(receipt)
    }
}
