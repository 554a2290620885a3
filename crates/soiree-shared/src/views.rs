//! Payload structs carried inside server frames and HTTP responses.
//!
//! These are projections of the persisted records: user ids are emails,
//! object ids are lowercase hex, timestamps are RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConversationStatus, GroupInvitationStatus, GroupMessageKind, GroupRole, InvitationStatus,
    MessageKind, ObjectId, UserId,
};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    /// Same value as `email`; chat clients key users by it.
    pub id: UserId,
    pub firstname: String,
    pub lastname: String,
    pub email: UserId,
}

impl UserProfile {
    /// "Firstname Lastname"
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname).trim().to_string()
    }

    /// "Firstname LASTNAME", used as push notification title.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname.to_uppercase())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantView {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Direct chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadMark {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessageView {
    pub id: ObjectId,
    pub conversation_id: ObjectId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub is_read: bool,
    pub read_by: Vec<ReadMark>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationView {
    pub id: ObjectId,
    pub participants: [UserId; 2],
    pub status: ConversationStatus,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessagePreview {
    pub content: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// One row of the conversation list. Pending sent invitations are rendered
/// with the invitation id, `status = pending` and no preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ObjectId,
    pub participant: ParticipantView,
    pub last_message: Option<LastMessagePreview>,
    pub status: ConversationStatus,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectInvitationView {
    pub id: ObjectId,
    pub from: UserProfile,
    pub to_user_id: UserId,
    pub message: String,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Group chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMessageView {
    pub id: ObjectId,
    pub group_id: ObjectId,
    pub sender_id: UserId,
    /// `None` for system messages.
    pub sender: Option<UserProfile>,
    pub content: String,
    pub message_type: GroupMessageKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub id: ObjectId,
    pub name: String,
    pub created_by: UserProfile,
    pub created_at: DateTime<Utc>,
    pub member_count: u64,
    pub unread_count: u64,
    pub last_message: Option<LastMessagePreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMemberView {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInvitationView {
    pub id: ObjectId,
    pub group_id: ObjectId,
    pub group_name: String,
    pub invited_by: UserProfile,
    pub invited_user: UserId,
    pub message: Option<String>,
    pub status: GroupInvitationStatus,
    pub invited_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}
