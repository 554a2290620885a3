use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use soiree_shared::types::GroupRole;
use soiree_shared::{ObjectId, UserId};

use crate::columns::{get_enum, get_id, get_ts, get_user, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::group_messages::insert_group_message;
use crate::models::{ChatGroup, GroupMember, GroupMessage, LeaveOutcome};

const GROUP_COLUMNS: &str = "g.id, g.name, g.created_by, g.created_at, g.updated_at, g.is_active";
const MEMBER_COLUMNS: &str = "group_id, user_id, role, joined_at";

impl Database {
    /// Create a group together with its creator's admin membership.
    pub fn create_group(&self, group: &ChatGroup, creator: &GroupMember) -> Result<()> {
        let tx = self.begin()?;
        tx.execute(
            "INSERT INTO chat_groups (id, name, created_by, created_at, updated_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group.id.to_hex(),
                group.name,
                group.created_by.as_str(),
                ts(&group.created_at),
                ts(&group.updated_at),
                group.is_active,
            ],
        )
        .map_err(|e| StoreError::from_write(e, "group already exists"))?;
        insert_member(&tx, creator)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_group(&self, id: ObjectId) -> Result<ChatGroup> {
        self.conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM chat_groups g WHERE g.id = ?1"),
                params![id.to_hex()],
                row_to_group,
            )
            .map_err(StoreError::from_query)
    }

    /// Active groups `user` belongs to, most recently updated first.
    pub fn list_groups_for_user(&self, user: &UserId) -> Result<Vec<ChatGroup>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM chat_groups g
             JOIN chat_group_members m ON m.group_id = g.id
             WHERE m.user_id = ?1 AND g.is_active = 1
             ORDER BY g.updated_at DESC, g.id DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn add_group_member(&self, member: &GroupMember) -> Result<()> {
        insert_member(self.conn(), member)
    }

    pub fn get_group_member(&self, group_id: ObjectId, user: &UserId) -> Result<Option<GroupMember>> {
        let member = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MEMBER_COLUMNS} FROM chat_group_members
                     WHERE group_id = ?1 AND user_id = ?2"
                ),
                params![group_id.to_hex(), user.as_str()],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    /// Members in join order.
    pub fn list_group_members(&self, group_id: ObjectId) -> Result<Vec<GroupMember>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM chat_group_members
             WHERE group_id = ?1
             ORDER BY joined_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![group_id.to_hex()], row_to_member)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn count_group_members(&self, group_id: ObjectId) -> Result<u64> {
        count_members(self.conn(), group_id, None)
    }

    /// Remove `user` from the group in one transaction, keeping the
    /// invariants of an active group:
    /// - the earliest-joined remaining member is promoted when the last
    ///   admin leaves
    /// - an emptied group becomes inactive
    ///
    /// `farewell` is persisted only when members remain.
    pub fn leave_group(
        &self,
        group_id: ObjectId,
        user: &UserId,
        at: DateTime<Utc>,
        farewell: &GroupMessage,
    ) -> Result<LeaveOutcome> {
        let tx = self.begin()?;

        let removed = tx.execute(
            "DELETE FROM chat_group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.to_hex(), user.as_str()],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }

        let remaining = count_members(&tx, group_id, None)?;
        let mut outcome = LeaveOutcome {
            promoted: None,
            remaining,
            deactivated: false,
        };

        if remaining == 0 {
            tx.execute(
                "UPDATE chat_groups SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![group_id.to_hex(), ts(&at)],
            )?;
            outcome.deactivated = true;
        } else {
            if count_members(&tx, group_id, Some(GroupRole::Admin))? == 0 {
                let heir: String = tx.query_row(
                    "SELECT user_id FROM chat_group_members
                     WHERE group_id = ?1
                     ORDER BY joined_at ASC, rowid ASC
                     LIMIT 1",
                    params![group_id.to_hex()],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE chat_group_members SET role = 'admin'
                     WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id.to_hex(), heir],
                )?;
                outcome.promoted = Some(
                    UserId::parse(&heir).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                );
            }
            insert_group_message(&tx, farewell)?;
        }

        tx.commit()?;
        Ok(outcome)
    }
}

pub(crate) fn insert_member(conn: &Connection, member: &GroupMember) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_group_members (group_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            member.group_id.to_hex(),
            member.user_id.as_str(),
            member.role.as_str(),
            ts(&member.joined_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, "already a member"))?;
    Ok(())
}

fn count_members(conn: &Connection, group_id: ObjectId, role: Option<GroupRole>) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_group_members
         WHERE group_id = ?1 AND (?2 IS NULL OR role = ?2)",
        params![group_id.to_hex(), role.map(|r| r.as_str())],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatGroup> {
    Ok(ChatGroup {
        id: get_id(row, 0)?,
        name: row.get(1)?,
        created_by: get_user(row, 2)?,
        created_at: get_ts(row, 3)?,
        updated_at: get_ts(row, 4)?,
        is_active: row.get(5)?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        group_id: get_id(row, 0)?,
        user_id: get_user(row, 1)?,
        role: get_enum(row, 2)?,
        joined_at: get_ts(row, 3)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::tests::{add_user, temp_db};

    pub(crate) fn new_group(db: &Database, creator: &UserId, name: &str) -> ChatGroup {
        let now = Utc::now();
        let group = ChatGroup {
            id: ObjectId::new(),
            name: name.into(),
            created_by: creator.clone(),
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        let admin = GroupMember {
            group_id: group.id,
            user_id: creator.clone(),
            role: GroupRole::Admin,
            joined_at: now,
        };
        db.create_group(&group, &admin).unwrap();
        group
    }

    pub(crate) fn join(db: &Database, group: &ChatGroup, user: &UserId) {
        db.add_group_member(&GroupMember {
            group_id: group.id,
            user_id: user.clone(),
            role: GroupRole::Member,
            joined_at: Utc::now(),
        })
        .unwrap();
    }

    fn farewell(group: &ChatGroup) -> GroupMessage {
        GroupMessage::system(group.id, "X a quitté le groupe".into())
    }

    #[test]
    fn creator_is_admin_member() {
        let (_dir, db) = temp_db();
        let c = add_user(&db, "c@x.com", "C", false);
        let group = new_group(&db, &c, "Bureau");

        let member = db.get_group_member(group.id, &c).unwrap().unwrap();
        assert!(member.is_admin());
        assert_eq!(db.count_group_members(group.id).unwrap(), 1);
        assert_eq!(db.list_groups_for_user(&c).unwrap().len(), 1);
    }

    #[test]
    fn membership_is_unique() {
        let (_dir, db) = temp_db();
        let c = add_user(&db, "c@x.com", "C", false);
        let group = new_group(&db, &c, "Bureau");
        let dup = GroupMember {
            group_id: group.id,
            user_id: c,
            role: GroupRole::Member,
            joined_at: Utc::now(),
        };
        assert!(matches!(db.add_group_member(&dup), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn last_admin_leaving_promotes_earliest_member() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", false);
        let b = add_user(&db, "b@x.com", "B", false);
        let c = add_user(&db, "c@x.com", "C", false);
        let group = new_group(&db, &a, "Team");
        join(&db, &group, &b);
        join(&db, &group, &c);

        let outcome = db.leave_group(group.id, &a, Utc::now(), &farewell(&group)).unwrap();
        assert_eq!(outcome.promoted, Some(b.clone()));
        assert_eq!(outcome.remaining, 2);
        assert!(!outcome.deactivated);

        let members = db.list_group_members(group.id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user_id, b);
        assert!(members[0].is_admin());
        assert!(!members[1].is_admin());
        assert!(db.get_group(group.id).unwrap().is_active);
        assert_eq!(db.count_group_messages(group.id).unwrap(), 1);
    }

    #[test]
    fn member_leaving_keeps_existing_admin() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", false);
        let b = add_user(&db, "b@x.com", "B", false);
        let group = new_group(&db, &a, "Team");
        join(&db, &group, &b);

        let outcome = db.leave_group(group.id, &b, Utc::now(), &farewell(&group)).unwrap();
        assert_eq!(outcome.promoted, None);
        assert_eq!(outcome.remaining, 1);
    }

    #[test]
    fn last_member_leaving_deactivates() {
        let (_dir, db) = temp_db();
        let a = add_user(&db, "a@x.com", "A", false);
        let group = new_group(&db, &a, "Solo");

        let outcome = db.leave_group(group.id, &a, Utc::now(), &farewell(&group)).unwrap();
        assert!(outcome.deactivated);
        assert!(!db.get_group(group.id).unwrap().is_active);
        assert!(db.list_groups_for_user(&a).unwrap().is_empty());
        assert_eq!(db.count_group_messages(group.id).unwrap(), 0);

        assert!(matches!(
            db.leave_group(group.id, &a, Utc::now(), &farewell(&group)),
            Err(StoreError::NotFound)
        ));
    }
}
