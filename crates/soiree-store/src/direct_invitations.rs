use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use soiree_shared::types::InvitationStatus;
use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_enum, get_id, get_opt_ts, get_ts, get_user, opt_ts, ts};
use crate::conversations::insert_conversation;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{DirectConversation, DirectInvitation};

const INVITATION_COLUMNS: &str =
    "id, from_user, to_user, message, status, created_at, responded_at";

impl Database {
    /// Insert a new invitation. A second pending invitation for the same
    /// `(from, to)` pair is rejected with [`StoreError::Conflict`].
    pub fn insert_direct_invitation(&self, invitation: &DirectInvitation) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO chat_invitations
                     (id, from_user, to_user, message, status, created_at, responded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    invitation.id.to_hex(),
                    invitation.from_user.as_str(),
                    invitation.to_user.as_str(),
                    invitation.message,
                    invitation.status.as_str(),
                    ts(&invitation.created_at),
                    opt_ts(&invitation.responded_at),
                ],
            )
            .map_err(|e| StoreError::from_write(e, "pending invitation already exists"))?;
        Ok(())
    }

    pub fn get_direct_invitation(&self, id: ObjectId) -> Result<DirectInvitation> {
        self.conn()
            .query_row(
                &format!("SELECT {INVITATION_COLUMNS} FROM chat_invitations WHERE id = ?1"),
                params![id.to_hex()],
                row_to_invitation,
            )
            .map_err(StoreError::from_query)
    }

    pub fn find_pending_direct_invitation(
        &self,
        from: &UserId,
        to: &UserId,
    ) -> Result<Option<DirectInvitation>> {
        let invitation = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {INVITATION_COLUMNS} FROM chat_invitations
                     WHERE from_user = ?1 AND to_user = ?2 AND status = 'pending'"
                ),
                params![from.as_str(), to.as_str()],
                row_to_invitation,
            )
            .optional()?;
        Ok(invitation)
    }

    /// Pending invitations addressed to `user`, newest first.
    pub fn list_received_invitations(&self, user: &UserId) -> Result<Vec<DirectInvitation>> {
        self.list_pending_invitations_by("to_user", user)
    }

    /// Pending invitations sent by `user`, newest first.
    pub fn list_sent_invitations(&self, user: &UserId) -> Result<Vec<DirectInvitation>> {
        self.list_pending_invitations_by("from_user", user)
    }

    fn list_pending_invitations_by(
        &self,
        column: &'static str,
        user: &UserId,
    ) -> Result<Vec<DirectInvitation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {INVITATION_COLUMNS} FROM chat_invitations
             WHERE {column} = ?1 AND status = 'pending'
             ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_invitation)?;

        let mut invitations = Vec::new();
        for row in rows {
            invitations.push(row?);
        }
        Ok(invitations)
    }

    /// Accept a pending invitation and create its conversation in one
    /// transaction. Fails with [`StoreError::Conflict`] when the invitation
    /// is no longer pending.
    pub fn accept_direct_invitation(
        &self,
        id: ObjectId,
        at: DateTime<Utc>,
        conversation: &DirectConversation,
    ) -> Result<()> {
        let tx = self.begin()?;
        close_invitation(&tx, id, InvitationStatus::Accepted, at)?;
        insert_conversation(&tx, conversation)?;
        tx.commit()?;
        Ok(())
    }

    pub fn reject_direct_invitation(&self, id: ObjectId, at: DateTime<Utc>) -> Result<()> {
        close_invitation(self.conn(), id, InvitationStatus::Rejected, at)
    }
}

fn close_invitation(
    conn: &rusqlite::Connection,
    id: ObjectId,
    status: InvitationStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    let affected = conn.execute(
        "UPDATE chat_invitations SET status = ?2, responded_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_hex(), status.as_str(), ts(&at)],
    )?;
    if affected == 0 {
        return Err(StoreError::Conflict("invitation is not pending".into()));
    }
    Ok(())
}

fn row_to_invitation(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectInvitation> {
    Ok(DirectInvitation {
        id: get_id(row, 0)?,
        from_user: get_user(row, 1)?,
        to_user: get_user(row, 2)?,
        message: row.get(3)?,
        status: get_enum(row, 4)?,
        created_at: get_ts(row, 5)?,
        responded_at: get_opt_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{add_user, temp_db};
    use soiree_shared::types::ConversationStatus;

    fn invitation(from: &UserId, to: &UserId) -> DirectInvitation {
        DirectInvitation {
            id: ObjectId::new(),
            from_user: from.clone(),
            to_user: to.clone(),
            message: "hi".into(),
            status: InvitationStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        }
    }

    fn conversation_for(inv: &DirectInvitation) -> DirectConversation {
        DirectConversation {
            id: ObjectId::new(),
            user_a: inv.from_user.clone(),
            user_b: inv.to_user.clone(),
            status: ConversationStatus::Accepted,
            created_by: inv.from_user.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_message_at: None,
        }
    }

    #[test]
    fn only_one_pending_per_pair() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", true);
        let b = add_user(&db, "b@x.com", "B", true);

        db.insert_direct_invitation(&invitation(&a, &b)).unwrap();
        assert!(matches!(
            db.insert_direct_invitation(&invitation(&a, &b)),
            Err(StoreError::Conflict(_))
        ));
        // The reverse direction is a different pair.
        db.insert_direct_invitation(&invitation(&b, &a)).unwrap();

        assert_eq!(db.list_received_invitations(&b).unwrap().len(), 1);
        assert_eq!(db.list_sent_invitations(&a).unwrap().len(), 1);
        assert!(db.find_pending_direct_invitation(&a, &b).unwrap().is_some());
    }

    #[test]
    fn accept_is_one_shot_and_creates_conversation() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", true);
        let b = add_user(&db, "b@x.com", "B", true);
        let inv = invitation(&a, &b);
        db.insert_direct_invitation(&inv).unwrap();

        let conv = conversation_for(&inv);
        db.accept_direct_invitation(inv.id, Utc::now(), &conv).unwrap();

        let stored = db.get_direct_invitation(inv.id).unwrap();
        assert_eq!(stored.status, InvitationStatus::Accepted);
        assert!(stored.responded_at.is_some());
        assert_eq!(db.get_conversation(conv.id).unwrap().status, ConversationStatus::Accepted);

        // Second respond: conflict, and no second conversation.
        let again = conversation_for(&inv);
        assert!(matches!(
            db.accept_direct_invitation(inv.id, Utc::now(), &again),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(db.get_conversation(again.id), Err(StoreError::NotFound)));
        assert!(matches!(
            db.reject_direct_invitation(inv.id, Utc::now()),
            Err(StoreError::Conflict(_))
        ));

        // Once answered, the pair may be invited again.
        db.insert_direct_invitation(&invitation(&a, &b)).unwrap();
    }

    #[test]
    fn reject_creates_nothing() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", true);
        let b = add_user(&db, "b@x.com", "B", true);
        let inv = invitation(&a, &b);
        db.insert_direct_invitation(&inv).unwrap();

        db.reject_direct_invitation(inv.id, Utc::now()).unwrap();
        assert_eq!(
            db.get_direct_invitation(inv.id).unwrap().status,
            InvitationStatus::Rejected
        );
        assert!(db.list_conversations_for(&a).unwrap().is_empty());
        assert!(db.list_received_invitations(&b).unwrap().is_empty());
    }
}
