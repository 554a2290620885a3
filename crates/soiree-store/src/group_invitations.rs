use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use soiree_shared::types::GroupInvitationStatus;
use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_enum, get_id, get_opt_ts, get_ts, get_user, opt_ts, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::group_messages::insert_group_message;
use crate::groups::insert_member;
use crate::models::{GroupInvitation, GroupMember, GroupMessage};

const INVITATION_COLUMNS: &str =
    "id, group_id, invited_by, invited_user, message, status, invited_at, responded_at";

impl Database {
    /// Insert a pending invitation. A second pending invitation for the same
    /// `(group, user)` is rejected with [`StoreError::Conflict`].
    pub fn insert_group_invitation(&self, invitation: &GroupInvitation) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO chat_group_invitations
                     (id, group_id, invited_by, invited_user, message, status, invited_at, responded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    invitation.id.to_hex(),
                    invitation.group_id.to_hex(),
                    invitation.invited_by.as_str(),
                    invitation.invited_user.as_str(),
                    invitation.message,
                    invitation.status.as_str(),
                    ts(&invitation.invited_at),
                    opt_ts(&invitation.responded_at),
                ],
            )
            .map_err(|e| StoreError::from_write(e, "pending group invitation already exists"))?;
        Ok(())
    }

    pub fn get_group_invitation(&self, id: ObjectId) -> Result<GroupInvitation> {
        self.conn()
            .query_row(
                &format!("SELECT {INVITATION_COLUMNS} FROM chat_group_invitations WHERE id = ?1"),
                params![id.to_hex()],
                row_to_invitation,
            )
            .map_err(StoreError::from_query)
    }

    pub fn find_pending_group_invitation(
        &self,
        group_id: ObjectId,
        user: &UserId,
    ) -> Result<Option<GroupInvitation>> {
        let invitation = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {INVITATION_COLUMNS} FROM chat_group_invitations
                     WHERE group_id = ?1 AND invited_user = ?2 AND status = 'pending'"
                ),
                params![group_id.to_hex(), user.as_str()],
                row_to_invitation,
            )
            .optional()?;
        Ok(invitation)
    }

    /// Pending invitations addressed to `user` for active groups, newest
    /// first.
    pub fn list_pending_group_invitations_for_user(
        &self,
        user: &UserId,
    ) -> Result<Vec<GroupInvitation>> {
        let mut stmt = self.conn().prepare(
            "SELECT i.id, i.group_id, i.invited_by, i.invited_user, i.message, i.status,
                    i.invited_at, i.responded_at
             FROM chat_group_invitations i
             JOIN chat_groups g ON g.id = i.group_id
             WHERE i.invited_user = ?1 AND i.status = 'pending' AND g.is_active = 1
             ORDER BY i.invited_at DESC, i.id DESC",
        )?;
        let rows = collect(stmt.query_map(params![user.as_str()], row_to_invitation)?);
        rows
    }

    /// Pending invitations of one group, newest first.
    pub fn list_pending_group_invitations(&self, group_id: ObjectId) -> Result<Vec<GroupInvitation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {INVITATION_COLUMNS} FROM chat_group_invitations
             WHERE group_id = ?1 AND status = 'pending'
             ORDER BY invited_at DESC, id DESC"
        ))?;
        let rows = collect(stmt.query_map(params![group_id.to_hex()], row_to_invitation)?);
        rows
    }

    /// Accept a pending invitation in one transaction: the invitation turns
    /// `accepted`, the member is inserted and the system message persisted.
    pub fn accept_group_invitation(
        &self,
        id: ObjectId,
        at: DateTime<Utc>,
        member: &GroupMember,
        announcement: &GroupMessage,
    ) -> Result<()> {
        let tx = self.begin()?;
        close_invitation(&tx, id, GroupInvitationStatus::Accepted, at)?;
        insert_member(&tx, member)?;
        insert_group_message(&tx, announcement)?;
        tx.commit()?;
        Ok(())
    }

    /// Move a pending invitation to `rejected` or `cancelled`.
    pub fn close_group_invitation(
        &self,
        id: ObjectId,
        status: GroupInvitationStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        close_invitation(self.conn(), id, status, at)
    }
}

fn close_invitation(
    conn: &Connection,
    id: ObjectId,
    status: GroupInvitationStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    let affected = conn.execute(
        "UPDATE chat_group_invitations SET status = ?2, responded_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_hex(), status.as_str(), ts(&at)],
    )?;
    if affected == 0 {
        return Err(StoreError::Conflict("group invitation is not pending".into()));
    }
    Ok(())
}

fn collect<I>(rows: I) -> Result<Vec<GroupInvitation>>
where
    I: Iterator<Item = rusqlite::Result<GroupInvitation>>,
{
    let mut invitations = Vec::new();
    for row in rows {
        invitations.push(row?);
    }
    Ok(invitations)
}

fn row_to_invitation(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupInvitation> {
    Ok(GroupInvitation {
        id: get_id(row, 0)?,
        group_id: get_id(row, 1)?,
        invited_by: get_user(row, 2)?,
        invited_user: get_user(row, 3)?,
        message: row.get(4)?,
        status: get_enum(row, 5)?,
        invited_at: get_ts(row, 6)?,
        responded_at: get_opt_ts(row, 7)?,
    })
}
