//! One-to-one chat between platform admins.
//!
//! A conversation only exists once an invitation has been accepted. Every
//! operation requires the caller to hold the admin flag in the user store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use soiree_shared::protocol::ServerFrame;
use soiree_shared::types::{ConversationStatus, InvitationAction, InvitationStatus, MessageKind};
use soiree_shared::views::{
    ConversationSummary, ConversationView, DirectInvitationView, DirectMessageView, ParticipantView,
    UserProfile,
};
use soiree_shared::{ObjectId, UserId};
use soiree_store::{Database, DirectConversation, DirectInvitation, DirectMessage};

use crate::auth::require_platform_admin;
use crate::error::{msg, on_conflict, on_missing, ChatError};
use crate::fanout::{truncate_body, NotificationFanout};
use crate::presence::PresenceView;
use crate::projection;
use crate::push::PushNotification;
use crate::storage::{page_size, search_size, Deadline, Storage};

#[derive(Clone)]
pub struct DirectChatService {
    storage: Storage,
    fanout: NotificationFanout,
    presence: Arc<dyn PresenceView>,
}

impl DirectChatService {
    pub fn new(storage: Storage, fanout: NotificationFanout, presence: Arc<dyn PresenceView>) -> Self {
        Self {
            storage,
            fanout,
            presence,
        }
    }

    pub async fn send_invitation(
        &self,
        from: &UserId,
        to: &UserId,
        message: &str,
    ) -> Result<DirectInvitationView, ChatError> {
        let (view, sender) = self
            .storage
            .run(Deadline::Point, |db| {
                let sender = require_platform_admin(db, from)?;
                if from == to {
                    return Err(ChatError::Validation(msg::SELF_INVITATION));
                }
                let target = db
                    .find_user(to)?
                    .ok_or(ChatError::NotFound(msg::USER_NOT_FOUND))?;
                if !target.is_admin {
                    return Err(ChatError::Forbidden(msg::TARGET_NOT_ADMIN));
                }
                if db.find_pending_direct_invitation(from, to)?.is_some() {
                    return Err(ChatError::Conflict(msg::INVITATION_PENDING));
                }

                let invitation = DirectInvitation {
                    id: ObjectId::new(),
                    from_user: from.clone(),
                    to_user: to.clone(),
                    message: message.trim().to_string(),
                    status: InvitationStatus::Pending,
                    created_at: Utc::now(),
                    responded_at: None,
                };
                db.insert_direct_invitation(&invitation)
                    .map_err(on_conflict(msg::INVITATION_PENDING))?;
                Ok((projection::direct_invitation_view(db, &invitation)?, projection::profile(&sender)))
            })
            .await?;

        info!(from = %from, to = %to, invitation = %view.id, "chat invitation sent");

        self.fanout
            .to_user(to, &ServerFrame::NewInvitation { invitation: view.clone() })
            .await;
        let push = PushNotification::new(sender.display_name(), "Vous invite à discuter")
            .with("type", "chat_invitation")
            .with("invitationId", view.id)
            .with("fromUserId", from)
            .with("fromUserName", sender.full_name());
        self.fanout.push(std::slice::from_ref(to), &push).await;

        Ok(view)
    }

    /// Pending invitations addressed to `user`, newest first.
    pub async fn list_received_invitations(&self, user: &UserId) -> Result<Vec<DirectInvitationView>, ChatError> {
        self.storage
            .run(Deadline::List, |db| {
                require_platform_admin(db, user)?;
                db.list_received_invitations(user)?
                    .iter()
                    .map(|inv| projection::direct_invitation_view(db, inv).map_err(ChatError::from))
                    .collect()
            })
            .await
    }

    /// Accept or reject an invitation addressed to `by`. Accepting returns
    /// the new conversation.
    pub async fn respond_to_invitation(
        &self,
        invitation_id: ObjectId,
        by: &UserId,
        action: InvitationAction,
    ) -> Result<Option<ConversationView>, ChatError> {
        let (invitation, conversation, responder) = self
            .storage
            .run(Deadline::Point, |db| {
                let responder = require_platform_admin(db, by)?;
                let invitation = db
                    .get_direct_invitation(invitation_id)
                    .map_err(on_missing(msg::INVITATION_NOT_FOUND))?;
                if invitation.to_user != *by {
                    return Err(ChatError::Forbidden(msg::NOT_INVITEE));
                }
                if invitation.status != InvitationStatus::Pending {
                    return Err(ChatError::Conflict(msg::ALREADY_RESPONDED));
                }

                let now = Utc::now();
                let conversation = match action {
                    InvitationAction::Accept => {
                        let conversation = DirectConversation {
                            id: ObjectId::new(),
                            user_a: invitation.from_user.clone(),
                            user_b: invitation.to_user.clone(),
                            status: ConversationStatus::Accepted,
                            created_by: invitation.from_user.clone(),
                            created_at: now,
                            updated_at: now,
                            last_message_at: None,
                        };
                        db.accept_direct_invitation(invitation_id, now, &conversation)
                            .map_err(on_conflict(msg::ALREADY_RESPONDED))?;
                        Some(projection::conversation_view(&conversation))
                    }
                    InvitationAction::Reject => {
                        db.reject_direct_invitation(invitation_id, now)
                            .map_err(on_conflict(msg::ALREADY_RESPONDED))?;
                        None
                    }
                };
                Ok((invitation, conversation, projection::profile(&responder)))
            })
            .await?;

        info!(invitation = %invitation_id, by = %by, action = %action, "chat invitation answered");

        match &conversation {
            Some(view) => {
                self.fanout
                    .to_user(
                        &invitation.from_user,
                        &ServerFrame::InvitationAccepted {
                            invitation_id,
                            conversation: view.clone(),
                        },
                    )
                    .await;
                let push = PushNotification::new(responder.display_name(), "A accepté votre invitation")
                    .with("type", "chat_invitation_accepted")
                    .with("invitationId", invitation_id)
                    .with("conversationId", view.id);
                self.fanout
                    .push(std::slice::from_ref(&invitation.from_user), &push)
                    .await;
            }
            None => {
                self.fanout
                    .to_user(&invitation.from_user, &ServerFrame::InvitationRejected { invitation_id })
                    .await;
            }
        }

        Ok(conversation)
    }

    pub async fn send_message(
        &self,
        conversation_id: ObjectId,
        sender_id: &UserId,
        content: &str,
        kind: Option<MessageKind>,
    ) -> Result<DirectMessageView, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation(msg::EMPTY_MESSAGE));
        }

        let (view, conversation, sender) = self
            .storage
            .run(Deadline::Point, |db| {
                let sender = require_platform_admin(db, sender_id)?;
                let conversation = participant_conversation(db, conversation_id, sender_id)?;

                let message = DirectMessage {
                    id: ObjectId::new(),
                    conversation_id,
                    sender_id: sender_id.clone(),
                    content: content.to_string(),
                    kind: kind.unwrap_or(MessageKind::Text),
                    is_read: false,
                    created_at: Utc::now(),
                };
                db.insert_direct_message(&message)?;
                Ok((
                    projection::direct_message_view(db, &message)?,
                    conversation,
                    projection::profile(&sender),
                ))
            })
            .await?;

        let participants = [conversation.user_a.clone(), conversation.user_b.clone()];
        self.fanout
            .to_users(
                &participants,
                &ServerFrame::NewMessage {
                    conversation_id,
                    message: view.clone(),
                },
            )
            .await;

        let recipient = conversation.other_participant(sender_id).clone();
        let push = PushNotification::new(sender.display_name(), truncate_body(content))
            .with("type", "chat_message")
            .with("conversationId", conversation_id)
            .with("messageId", view.id)
            .with("senderId", sender_id)
            .with("senderName", sender.full_name());
        self.fanout.push(&[recipient], &push).await;

        Ok(view)
    }

    /// Record that `by` read one message. Reading twice changes nothing.
    pub async fn mark_message_read(&self, message_id: ObjectId, by: &UserId) -> Result<(), ChatError> {
        let read_at = Utc::now();
        let newly_read = self
            .storage
            .run(Deadline::Point, |db| {
                require_platform_admin(db, by)?;
                let message = db
                    .get_direct_message(message_id)
                    .map_err(on_missing(msg::MESSAGE_NOT_FOUND))?;
                participant_conversation(db, message.conversation_id, by)?;
                if message.sender_id == *by {
                    return Ok(None);
                }
                let inserted = db.mark_direct_message_read(message_id, by, read_at)?;
                Ok(inserted.then_some(message))
            })
            .await?;

        if let Some(message) = newly_read {
            self.fanout
                .to_user(
                    &message.sender_id,
                    &ServerFrame::MessagesRead {
                        conversation_id: message.conversation_id,
                        read_by: by.clone(),
                        read_at,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Mark every incoming message of the conversation as read by `by`.
    /// Returns how many were newly marked.
    pub async fn mark_conversation_read(&self, conversation_id: ObjectId, by: &UserId) -> Result<usize, ChatError> {
        let read_at = Utc::now();
        let marked = self
            .storage
            .run(Deadline::List, |db| {
                require_platform_admin(db, by)?;
                participant_conversation(db, conversation_id, by)?;
                Ok(db.mark_conversation_read(conversation_id, by, read_at)?)
            })
            .await?;

        let senders: BTreeSet<UserId> = marked.iter().map(|m| m.sender_id.clone()).collect();
        if !senders.is_empty() {
            let senders: Vec<UserId> = senders.into_iter().collect();
            self.fanout
                .to_users(
                    &senders,
                    &ServerFrame::MessagesRead {
                        conversation_id,
                        read_by: by.clone(),
                        read_at,
                    },
                )
                .await;
        }

        debug!(conversation = %conversation_id, by = %by, marked = marked.len(), "conversation read");
        Ok(marked.len())
    }

    pub async fn list_messages(
        &self,
        conversation_id: ObjectId,
        by: &UserId,
        limit: Option<u32>,
        before: Option<ObjectId>,
    ) -> Result<Vec<DirectMessageView>, ChatError> {
        let limit = page_size(limit);
        self.storage
            .run(Deadline::List, |db| {
                require_platform_admin(db, by)?;
                participant_conversation(db, conversation_id, by)?;
                db.list_direct_messages(conversation_id, limit, before)?
                    .iter()
                    .map(|m| projection::direct_message_view(db, m).map_err(ChatError::from))
                    .collect()
            })
            .await
    }

    /// Open conversations of `user`, then the invitations `user` sent that
    /// are still pending, shown as placeholders.
    pub async fn list_conversations(&self, user: &UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        let mut summaries = self
            .storage
            .run(Deadline::Aggregate, |db| {
                require_platform_admin(db, user)?;

                let mut summaries = Vec::new();
                for conversation in db.list_conversations_for(user)? {
                    let other = conversation.other_participant(user);
                    summaries.push(ConversationSummary {
                        id: conversation.id,
                        participant: participant(db, other)?,
                        last_message: db
                            .last_direct_message(conversation.id)?
                            .as_ref()
                            .map(projection::direct_preview),
                        status: conversation.status,
                        unread_count: db.count_unread_direct(conversation.id, user)?,
                    });
                }

                for invitation in db.list_sent_invitations(user)? {
                    summaries.push(ConversationSummary {
                        id: invitation.id,
                        participant: participant(db, &invitation.to_user)?,
                        last_message: None,
                        status: ConversationStatus::Pending,
                        unread_count: 0,
                    });
                }
                Ok(summaries)
            })
            .await?;

        for summary in &mut summaries {
            summary.participant.is_online = self.presence.is_online(&summary.participant.profile.id).await;
        }
        Ok(summaries)
    }

    /// Admins matching `query`, excluding the caller.
    pub async fn search_admins(
        &self,
        caller: &UserId,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<UserProfile>, ChatError> {
        let limit = search_size(limit);
        self.storage
            .run(Deadline::List, |db| {
                require_platform_admin(db, caller)?;
                Ok(db
                    .search_users(query, limit, Some(caller), true)?
                    .iter()
                    .map(projection::profile)
                    .collect())
            })
            .await
    }
}

fn participant_conversation(
    db: &Database,
    conversation_id: ObjectId,
    user: &UserId,
) -> Result<DirectConversation, ChatError> {
    let conversation = db
        .get_conversation(conversation_id)
        .map_err(on_missing(msg::CONVERSATION_NOT_FOUND))?;
    if !conversation.has_participant(user) {
        return Err(ChatError::Forbidden(msg::CONVERSATION_FORBIDDEN));
    }
    Ok(conversation)
}

/// Presence is filled in by the caller, outside the storage lock.
fn participant(db: &Database, user: &UserId) -> Result<ParticipantView, ChatError> {
    let last_seen = db.find_user(user)?.and_then(|u| u.last_seen);
    Ok(ParticipantView {
        profile: projection::profile_or_email(db, user)?,
        is_online: false,
        last_seen,
    })
}
