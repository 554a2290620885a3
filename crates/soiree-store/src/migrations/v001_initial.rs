//! v001 -- Initial schema creation.
//!
//! Creates the user directory and push-token registry read by the chat core,
//! and the eight chat collections it owns.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
///
/// Object ids are 24-char lowercase hex, so `id < ?` follows creation order.
/// Timestamps are RFC 3339 with microseconds in UTC, so text order is time
/// order.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (directory owned by the account service)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    email      TEXT PRIMARY KEY NOT NULL,   -- lowercase, trimmed
    firstname  TEXT NOT NULL,
    lastname   TEXT NOT NULL,
    is_admin   INTEGER NOT NULL DEFAULT 0,
    last_seen  TEXT,
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Push tokens
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS fcm_tokens (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT NOT NULL,               -- email
    device     TEXT,
    user_agent TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fcm_tokens_user ON fcm_tokens(user_id);

-- ----------------------------------------------------------------
-- Direct chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_invitations (
    id           TEXT PRIMARY KEY NOT NULL,
    from_user    TEXT NOT NULL,
    to_user      TEXT NOT NULL,
    message      TEXT NOT NULL DEFAULT '',
    status       TEXT NOT NULL,             -- pending | accepted | rejected
    created_at   TEXT NOT NULL,
    responded_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS uniq_chat_invitations_pending
    ON chat_invitations(from_user, to_user) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_chat_invitations_to
    ON chat_invitations(to_user, status);

CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,
    user_a          TEXT NOT NULL,
    user_b          TEXT NOT NULL,
    status          TEXT NOT NULL,          -- pending | accepted | rejected | active
    created_by      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_message_at TEXT,

    CHECK (user_a <> user_b)
);

CREATE INDEX IF NOT EXISTS idx_conversations_user_a ON conversations(user_a);
CREATE INDEX IF NOT EXISTS idx_conversations_user_b ON conversations(user_b);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    content         TEXT NOT NULL,
    kind            TEXT NOT NULL,          -- text | image | file
    is_read         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, id);

-- readBy set: one row per (message, reader)
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Group chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_active  INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS chat_group_members (
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL,                -- admin | member
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_group_members_user
    ON chat_group_members(user_id);

CREATE TABLE IF NOT EXISTS chat_group_invitations (
    id           TEXT PRIMARY KEY NOT NULL,
    group_id     TEXT NOT NULL,
    invited_by   TEXT NOT NULL,
    invited_user TEXT NOT NULL,
    message      TEXT,
    status       TEXT NOT NULL,             -- pending | accepted | rejected | cancelled
    invited_at   TEXT NOT NULL,
    responded_at TEXT,

    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS uniq_chat_group_invitations_pending
    ON chat_group_invitations(group_id, invited_user) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_chat_group_invitations_user
    ON chat_group_invitations(invited_user, status);

CREATE TABLE IF NOT EXISTS chat_group_messages (
    id           TEXT PRIMARY KEY NOT NULL,
    group_id     TEXT NOT NULL,
    sender_id    TEXT NOT NULL,             -- email, or 'system'
    content      TEXT NOT NULL,
    message_type TEXT NOT NULL,             -- message | system
    created_at   TEXT NOT NULL,

    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_group_messages_group
    ON chat_group_messages(group_id, id);

CREATE TABLE IF NOT EXISTS chat_group_read_receipts (
    group_id             TEXT NOT NULL,
    user_id              TEXT NOT NULL,
    last_read_message_id TEXT,
    last_read_at         TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
