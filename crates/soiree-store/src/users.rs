use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use soiree_shared::UserId;

use crate::columns::{contains_pattern, get_opt_ts, get_ts, get_user, opt_ts, ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

const USER_COLUMNS: &str = "email, firstname, lastname, is_admin, last_seen, created_at";

impl Database {
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (email, firstname, lastname, is_admin, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.email.as_str(),
                    user.firstname,
                    user.lastname,
                    user.is_admin,
                    opt_ts(&user.last_seen),
                    ts(&user.created_at),
                ],
            )
            .map_err(|e| StoreError::from_write(e, "user already exists"))?;
        Ok(())
    }

    pub fn get_user(&self, email: &UserId) -> Result<User> {
        self.find_user(email)?.ok_or(StoreError::NotFound)
    }

    pub fn find_user(&self, email: &UserId) -> Result<Option<User>> {
        if email.is_system() {
            return Ok(None);
        }
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Users matching `query` (case-insensitive substring of first name,
    /// last name or email), ordered by name.
    pub fn search_users(
        &self,
        query: &str,
        limit: u32,
        exclude: Option<&UserId>,
        admins_only: bool,
    ) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE (lower(firstname) LIKE ?1 ESCAPE '\\'
                    OR lower(lastname) LIKE ?1 ESCAPE '\\'
                    OR email LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR email <> ?2)
               AND (?3 = 0 OR is_admin = 1)
             ORDER BY lower(firstname), lower(lastname), email
             LIMIT ?4"
        ))?;

        let rows = stmt.query_map(
            params![
                contains_pattern(query.trim()),
                exclude.map(UserId::as_str),
                admins_only,
                limit,
            ],
            row_to_user,
        )?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Set the platform admin flag. Returns `true` when the value changed.
    pub fn set_user_admin(&self, email: &UserId, is_admin: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET is_admin = ?2 WHERE email = ?1 AND is_admin <> ?2",
            params![email.as_str(), is_admin],
        )?;
        if affected == 0 {
            // Distinguish "unchanged" from "no such user".
            self.get_user(email)?;
        }
        Ok(affected > 0)
    }

    pub fn update_last_seen(&self, email: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET last_seen = ?2 WHERE email = ?1",
            params![email.as_str(), ts(&at)],
        )?;
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        email: get_user(row, 0)?,
        firstname: row.get(1)?,
        lastname: row.get(2)?,
        is_admin: row.get(3)?,
        last_seen: get_opt_ts(row, 4)?,
        created_at: get_ts(row, 5)?,
    })
}
