//! Records persisted in the chat database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use soiree_shared::types::{
    ConversationStatus, GroupInvitationStatus, GroupMessageKind, GroupRole, InvitationStatus,
    MessageKind,
};
use soiree_shared::{ObjectId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A platform user as seen by the chat core.  The primary key is the email.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub email: UserId,
    pub firstname: String,
    pub lastname: String,
    pub is_admin: bool,
    /// Last offline transition observed by the presence tracker.
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Direct chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectInvitation {
    pub id: ObjectId,
    pub from_user: UserId,
    pub to_user: UserId,
    pub message: String,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// A conversation between exactly two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectConversation {
    pub id: ObjectId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub status: ConversationStatus,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl DirectConversation {
    pub fn has_participant(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    /// The participant that is not `user`.
    pub fn other_participant(&self, user: &UserId) -> &UserId {
        if &self.user_a == user {
            &self.user_b
        } else {
            &self.user_a
        }
    }

    pub fn participants(&self) -> [&UserId; 2] {
        [&self.user_a, &self.user_b]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: ObjectId,
    pub conversation_id: ObjectId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// One entry of a direct message's `readBy` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRead {
    pub message_id: ObjectId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Deletion is logical: `is_active = false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatGroup {
    pub id: ObjectId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: ObjectId,
    pub user_id: UserId,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn is_admin(&self) -> bool {
        self.role == GroupRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInvitation {
    pub id: ObjectId,
    pub group_id: ObjectId,
    pub invited_by: UserId,
    pub invited_user: UserId,
    pub message: Option<String>,
    pub status: GroupInvitationStatus,
    pub invited_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMessage {
    pub id: ObjectId,
    pub group_id: ObjectId,
    /// An email, or [`UserId::system`] for system messages.
    pub sender_id: UserId,
    pub content: String,
    pub kind: GroupMessageKind,
    pub created_at: DateTime<Utc>,
}

impl GroupMessage {
    /// A system message ("X a rejoint le groupe") stamped now.
    pub fn system(group_id: ObjectId, content: String) -> Self {
        Self {
            id: ObjectId::new(),
            group_id,
            sender_id: UserId::system(),
            content,
            kind: GroupMessageKind::System,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupReadReceipt {
    pub group_id: ObjectId,
    pub user_id: UserId,
    pub last_read_message_id: Option<ObjectId>,
    pub last_read_at: DateTime<Utc>,
}

/// What happened to a group when a member left it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Member promoted to admin because the last admin left.
    pub promoted: Option<UserId>,
    /// Members still in the group.
    pub remaining: u64,
    /// The group was emptied and is now inactive.
    pub deactivated: bool,
}

// ---------------------------------------------------------------------------
// Push tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushToken {
    pub token: String,
    pub user_id: UserId,
    pub device: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
