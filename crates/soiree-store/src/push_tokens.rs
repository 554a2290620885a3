use rusqlite::params;

use soiree_shared::UserId;

use crate::columns::ts;
use crate::database::Database;
use crate::error::Result;
use crate::models::PushToken;

impl Database {
    /// Register a device token. A token belongs to one user at a time, so
    /// re-registering moves it.
    pub fn upsert_push_token(&self, token: &PushToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO fcm_tokens (token, user_id, device, user_agent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (token) DO UPDATE SET
                 user_id = excluded.user_id,
                 device = excluded.device,
                 user_agent = excluded.user_agent,
                 updated_at = excluded.updated_at",
            params![
                token.token,
                token.user_id.as_str(),
                token.device,
                token.user_agent,
                ts(&token.created_at),
                ts(&token.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Tokens of every listed user, deduplicated.
    pub fn push_tokens_for_users(&self, users: &[UserId]) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT token FROM fcm_tokens WHERE user_id = ?1 ORDER BY created_at ASC")?;

        let mut tokens = Vec::new();
        for user in users {
            let rows = stmt.query_map(params![user.as_str()], |row| row.get::<_, String>(0))?;
            for row in rows {
                let token = row?;
                if !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
        }
        Ok(tokens)
    }

    /// Delete a token registered by `user`. Returns whether it existed.
    pub fn delete_push_token(&self, user: &UserId, token: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM fcm_tokens WHERE token = ?1 AND user_id = ?2",
            params![token, user.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Prune tokens the push provider reported as invalid.
    pub fn delete_push_tokens(&self, tokens: &[String]) -> Result<usize> {
        let mut stmt = self.conn().prepare("DELETE FROM fcm_tokens WHERE token = ?1")?;
        let mut deleted = 0;
        for token in tokens {
            deleted += stmt.execute(params![token])?;
        }
        Ok(deleted)
    }
}
