//! Stored records to wire views.
//!
//! Sender profiles of group messages are resolved here and only here: the
//! system sender is never looked up in the user directory.

use std::collections::HashMap;

use soiree_shared::types::GroupMessageKind;
use soiree_shared::views::{
    ConversationView, DirectInvitationView, DirectMessageView, GroupInvitationView,
    GroupMessageView, LastMessagePreview, ReadMark, UserProfile,
};
use soiree_shared::UserId;
use soiree_store::{
    Database, DirectConversation, DirectInvitation, DirectMessage, GroupInvitation, GroupMessage,
    Result, StoreError, User,
};

pub fn profile(user: &User) -> UserProfile {
    UserProfile {
        id: user.email.clone(),
        firstname: user.firstname.clone(),
        lastname: user.lastname.clone(),
        email: user.email.clone(),
    }
}

/// Profile of a user that must exist.
pub fn load_profile(db: &Database, id: &UserId) -> Result<UserProfile> {
    if id.is_system() {
        return Err(StoreError::NotFound);
    }
    Ok(profile(&db.get_user(id)?))
}

/// Profile of a user that may have left the directory since; falls back to
/// the bare email.
pub fn profile_or_email(db: &Database, id: &UserId) -> Result<UserProfile> {
    let found = if id.is_system() { None } else { db.find_user(id)? };
    Ok(found.as_ref().map(profile).unwrap_or_else(|| UserProfile {
        id: id.clone(),
        firstname: String::new(),
        lastname: String::new(),
        email: id.clone(),
    }))
}

fn sender_profile(
    db: &Database,
    message: &GroupMessage,
    cache: &mut HashMap<UserId, Option<UserProfile>>,
) -> Result<Option<UserProfile>> {
    if message.kind == GroupMessageKind::System || message.sender_id.is_system() {
        return Ok(None);
    }
    if let Some(cached) = cache.get(&message.sender_id) {
        return Ok(cached.clone());
    }
    let resolved = db.find_user(&message.sender_id)?.as_ref().map(profile);
    cache.insert(message.sender_id.clone(), resolved.clone());
    Ok(resolved)
}

pub fn group_message_view(db: &Database, message: &GroupMessage) -> Result<GroupMessageView> {
    let sender = sender_profile(db, message, &mut HashMap::new())?;
    Ok(group_view_with(message, sender))
}

/// Project a page of messages, resolving each distinct sender once.
pub fn group_message_views(db: &Database, messages: &[GroupMessage]) -> Result<Vec<GroupMessageView>> {
    let mut cache = HashMap::new();
    let mut views = Vec::with_capacity(messages.len());
    for message in messages {
        let sender = sender_profile(db, message, &mut cache)?;
        views.push(group_view_with(message, sender));
    }
    Ok(views)
}

fn group_view_with(message: &GroupMessage, sender: Option<UserProfile>) -> GroupMessageView {
    GroupMessageView {
        id: message.id,
        group_id: message.group_id,
        sender_id: message.sender_id.clone(),
        sender,
        content: message.content.clone(),
        message_type: message.kind,
        created_at: message.created_at,
    }
}

pub fn direct_message_view(db: &Database, message: &DirectMessage) -> Result<DirectMessageView> {
    let read_by = db
        .direct_message_reads(message.id)?
        .into_iter()
        .map(|r| ReadMark {
            user_id: r.user_id,
            read_at: r.read_at,
        })
        .collect();
    Ok(DirectMessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
        is_read: message.is_read,
        read_by,
        created_at: message.created_at,
    })
}

pub fn conversation_view(conversation: &DirectConversation) -> ConversationView {
    ConversationView {
        id: conversation.id,
        participants: [conversation.user_a.clone(), conversation.user_b.clone()],
        status: conversation.status,
        created_by: conversation.created_by.clone(),
        created_at: conversation.created_at,
        last_message_at: conversation.last_message_at,
    }
}

pub fn direct_invitation_view(db: &Database, invitation: &DirectInvitation) -> Result<DirectInvitationView> {
    Ok(DirectInvitationView {
        id: invitation.id,
        from: profile_or_email(db, &invitation.from_user)?,
        to_user_id: invitation.to_user.clone(),
        message: invitation.message.clone(),
        status: invitation.status,
        created_at: invitation.created_at,
        responded_at: invitation.responded_at,
    })
}

pub fn group_invitation_view(db: &Database, invitation: &GroupInvitation) -> Result<GroupInvitationView> {
    let group = db.get_group(invitation.group_id)?;
    Ok(GroupInvitationView {
        id: invitation.id,
        group_id: invitation.group_id,
        group_name: group.name,
        invited_by: profile_or_email(db, &invitation.invited_by)?,
        invited_user: invitation.invited_user.clone(),
        message: invitation.message.clone(),
        status: invitation.status,
        invited_at: invitation.invited_at,
        responded_at: invitation.responded_at,
    })
}

pub fn direct_preview(message: &DirectMessage) -> LastMessagePreview {
    LastMessagePreview {
        content: message.content.clone(),
        sender_id: message.sender_id.clone(),
        created_at: message.created_at,
        is_read: message.is_read,
    }
}

pub fn group_preview(message: &GroupMessage, is_read: bool) -> LastMessagePreview {
    LastMessagePreview {
        content: message.content.clone(),
        sender_id: message.sender_id.clone(),
        created_at: message.created_at,
        is_read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use chrono::Utc;
    use soiree_shared::ObjectId;

    fn message(group_id: ObjectId, sender: &UserId, text: &str) -> GroupMessage {
        GroupMessage {
            id: ObjectId::new(),
            group_id,
            sender_id: sender.clone(),
            content: text.into(),
            kind: GroupMessageKind::Message,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn system_messages_have_no_sender_profile() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", true).await;

        env.storage
            .run(crate::storage::Deadline::Point, |db| {
                let group_id = ObjectId::new();
                let system = GroupMessage::system(group_id, "Anne Test a rejoint le groupe".into());
                let regular = message(group_id, &a, "salut");

                let views = group_message_views(db, &[system, regular])?;
                assert!(views[0].sender.is_none());
                assert!(views[0].sender_id.is_system());
                assert_eq!(views[1].sender.as_ref().map(|p| p.firstname.as_str()), Some("Anne"));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_users_degrade_to_email() {
        let env = TestEnv::new().await;
        let ghost = UserId::parse("ghost@x.com").unwrap();

        env.storage
            .run(crate::storage::Deadline::Point, |db| {
                let fallback = profile_or_email(db, &ghost)?;
                assert_eq!(fallback.email, ghost);
                assert!(fallback.firstname.is_empty());
                assert!(load_profile(db, &ghost).is_err());
                assert!(load_profile(db, &UserId::system()).is_err());

                let view = group_message_view(db, &message(ObjectId::new(), &ghost, "hi"))?;
                assert!(view.sender.is_none());
                Ok(())
            })
            .await
            .unwrap();
    }
}
