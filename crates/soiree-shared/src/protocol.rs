use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::types::{ObjectId, UserId};
use crate::views::{
    ConversationView, DirectInvitationView, DirectMessageView, GroupInvitationView,
    GroupMessageView, GroupSummary, UserProfile,
};

/// Frames a client may send over the chat socket.
///
/// The first frame of every session must be [`ClientFrame::Authenticate`].
/// Frames with an unrecognized `type` decode to [`ClientFrame::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    JoinConversation {
        conversation_id: ObjectId,
    },
    LeaveConversation {
        conversation_id: ObjectId,
    },
    JoinGroup {
        group_id: ObjectId,
    },
    LeaveGroup {
        group_id: ObjectId,
    },
    /// Carries either a conversation or a group id.
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ObjectId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<ObjectId>,
        is_typing: bool,
    },
    GroupTyping {
        group_id: ObjectId,
        is_typing: bool,
    },
    /// Activity heartbeat.
    UserPresence {
        is_online: bool,
    },
    #[serde(skip)]
    Unknown {
        kind: String,
    },
}

impl ClientFrame {
    const KNOWN_TYPES: [&'static str; 8] = [
        "authenticate",
        "join_conversation",
        "leave_conversation",
        "join_group",
        "leave_group",
        "typing",
        "group_typing",
        "user_presence",
    ];

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(FrameError::NotJson)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(FrameError::MissingType)?
            .to_string();

        if !Self::KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Self::Unknown { kind });
        }

        serde_json::from_value(value).map_err(|source| FrameError::Malformed { kind, source })
    }

    /// The wire `type` of this frame.
    pub fn kind(&self) -> &str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::JoinGroup { .. } => "join_group",
            Self::LeaveGroup { .. } => "leave_group",
            Self::Typing { .. } => "typing",
            Self::GroupTyping { .. } => "group_typing",
            Self::UserPresence { .. } => "user_presence",
            Self::Unknown { kind } => kind,
        }
    }
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated {
        user_id: UserId,
    },
    Error {
        message: String,
    },

    // -- Direct chat --
    NewMessage {
        conversation_id: ObjectId,
        message: DirectMessageView,
    },
    NewInvitation {
        invitation: DirectInvitationView,
    },
    InvitationAccepted {
        invitation_id: ObjectId,
        conversation: ConversationView,
    },
    InvitationRejected {
        invitation_id: ObjectId,
    },
    MessagesRead {
        conversation_id: ObjectId,
        read_by: UserId,
        read_at: DateTime<Utc>,
    },
    UserTyping {
        conversation_id: ObjectId,
        user_id: UserId,
        is_typing: bool,
    },

    // -- Group chat --
    NewGroupMessage {
        group_id: ObjectId,
        message: GroupMessageView,
    },
    GroupCreated {
        group: GroupSummary,
    },
    GroupInvitation {
        invitation: GroupInvitationView,
    },
    GroupInvitationAccepted {
        invitation_id: ObjectId,
        group_id: ObjectId,
        user: UserProfile,
        accepted_at: DateTime<Utc>,
    },
    GroupInvitationRejected {
        invitation_id: ObjectId,
        group_id: ObjectId,
        user: UserProfile,
        rejected_at: DateTime<Utc>,
    },
    GroupMemberJoined {
        group_id: ObjectId,
        user: UserProfile,
        system_message: GroupMessageView,
    },
    GroupMemberLeft {
        group_id: ObjectId,
        user_id: UserId,
        system_message: Option<GroupMessageView>,
    },
    GroupMessagesRead {
        group_id: ObjectId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    },
    GroupUserTyping {
        group_id: ObjectId,
        user_id: UserId,
        is_typing: bool,
    },

    // -- Users --
    PresenceUpdate {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    /// Platform admin flag changed, or promotion to group admin when
    /// `group_id` is set.
    AdminRightsChanged {
        user_email: UserId,
        admin: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<ObjectId>,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire `type` of this frame, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Error { .. } => "error",
            Self::NewMessage { .. } => "new_message",
            Self::NewInvitation { .. } => "new_invitation",
            Self::InvitationAccepted { .. } => "invitation_accepted",
            Self::InvitationRejected { .. } => "invitation_rejected",
            Self::MessagesRead { .. } => "messages_read",
            Self::UserTyping { .. } => "user_typing",
            Self::NewGroupMessage { .. } => "new_group_message",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupInvitation { .. } => "group_invitation",
            Self::GroupInvitationAccepted { .. } => "group_invitation_accepted",
            Self::GroupInvitationRejected { .. } => "group_invitation_rejected",
            Self::GroupMemberJoined { .. } => "group_member_joined",
            Self::GroupMemberLeft { .. } => "group_member_left",
            Self::GroupMessagesRead { .. } => "group_messages_read",
            Self::GroupUserTyping { .. } => "group_user_typing",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::AdminRightsChanged { .. } => "admin_rights_changed",
        }
    }
}
