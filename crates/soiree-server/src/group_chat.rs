//! Group chat: groups, memberships, invitations and messages.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use soiree_shared::constants::MIN_SEARCH_QUERY_CHARS;
use soiree_shared::protocol::ServerFrame;
use soiree_shared::types::{GroupInvitationStatus, GroupMessageKind, GroupRole, InvitationAction};
use soiree_shared::views::{
    GroupInvitationView, GroupMemberView, GroupMessageView, GroupSummary, UserProfile,
};
use soiree_shared::{ObjectId, UserId};
use soiree_store::{ChatGroup, Database, GroupInvitation, GroupMember, GroupMessage};

use crate::error::{msg, on_conflict, on_missing, ChatError};
use crate::fanout::{truncate_body, NotificationFanout};
use crate::presence::PresenceView;
use crate::projection;
use crate::push::PushNotification;
use crate::receipts::{unread_in, ReadReceiptEngine};
use crate::rooms::Room;
use crate::storage::{page_size, search_size, Deadline, Storage};

/// Result of answering a group invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvitationResponse {
    pub invitation_id: ObjectId,
    pub group_id: ObjectId,
    pub status: GroupInvitationStatus,
}

#[derive(Clone)]
pub struct GroupChatService {
    storage: Storage,
    fanout: NotificationFanout,
    presence: Arc<dyn PresenceView>,
    receipts: ReadReceiptEngine,
}

impl GroupChatService {
    pub fn new(
        storage: Storage,
        fanout: NotificationFanout,
        presence: Arc<dyn PresenceView>,
        receipts: ReadReceiptEngine,
    ) -> Self {
        Self {
            storage,
            fanout,
            presence,
            receipts,
        }
    }

    /// Create a group owned by `creator` and invite every existing user of
    /// `member_ids`. Unknown users are skipped.
    pub async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<GroupSummary, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation(msg::GROUP_NAME_REQUIRED));
        }

        let (summary, owner, invitations) = self
            .storage
            .run(Deadline::List, |db| {
                let owner = projection::load_profile(db, creator).map_err(on_missing(msg::USER_NOT_FOUND))?;
                let now = Utc::now();
                let group = ChatGroup {
                    id: ObjectId::new(),
                    name: name.to_string(),
                    created_by: creator.clone(),
                    created_at: now,
                    updated_at: now,
                    is_active: true,
                };
                db.create_group(
                    &group,
                    &GroupMember {
                        group_id: group.id,
                        user_id: creator.clone(),
                        role: GroupRole::Admin,
                        joined_at: now,
                    },
                )?;

                let invitees: BTreeSet<&UserId> = member_ids.iter().filter(|u| *u != creator).collect();
                let mut invitations = Vec::new();
                for invitee in invitees {
                    if db.find_user(invitee)?.is_none() {
                        debug!(group = %group.id, user = %invitee, "skipping unknown invitee");
                        continue;
                    }
                    if db.find_pending_group_invitation(group.id, invitee)?.is_some() {
                        continue;
                    }
                    let invitation = pending_invitation(group.id, creator, invitee, None);
                    db.insert_group_invitation(&invitation)?;
                    invitations.push(projection::group_invitation_view(db, &invitation)?);
                }

                let summary = GroupSummary {
                    id: group.id,
                    name: group.name,
                    created_by: owner.clone(),
                    created_at: group.created_at,
                    member_count: 1,
                    unread_count: 0,
                    last_message: None,
                };
                Ok((summary, owner, invitations))
            })
            .await?;

        info!(group = %summary.id, creator = %creator, invited = invitations.len(), "group created");

        self.fanout
            .to_user(creator, &ServerFrame::GroupCreated { group: summary.clone() })
            .await;
        for invitation in invitations {
            self.announce_invitation(&owner, invitation).await;
        }
        Ok(summary)
    }

    /// Invite `user_id` into an active group. `by` must be a group admin.
    pub async fn invite(
        &self,
        group_id: ObjectId,
        by: &UserId,
        user_id: &UserId,
        message: Option<String>,
    ) -> Result<GroupInvitationView, ChatError> {
        let (view, inviter) = self
            .storage
            .run(Deadline::Point, |db| {
                active_group(db, group_id)?;
                require_group_admin(db, group_id, by)?;
                if db.find_user(user_id)?.is_none() {
                    return Err(ChatError::NotFound(msg::USER_NOT_FOUND));
                }
                if db.get_group_member(group_id, user_id)?.is_some() {
                    return Err(ChatError::Conflict(msg::ALREADY_MEMBER));
                }
                if db.find_pending_group_invitation(group_id, user_id)?.is_some() {
                    return Err(ChatError::Conflict(msg::INVITATION_PENDING));
                }

                let message = message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
                let invitation = pending_invitation(group_id, by, user_id, message);
                db.insert_group_invitation(&invitation)
                    .map_err(on_conflict(msg::INVITATION_PENDING))?;
                Ok((
                    projection::group_invitation_view(db, &invitation)?,
                    projection::profile_or_email(db, by)?,
                ))
            })
            .await?;

        info!(group = %group_id, by = %by, user = %user_id, "group invitation sent");
        self.announce_invitation(&inviter, view.clone()).await;
        Ok(view)
    }

    async fn announce_invitation(&self, inviter: &UserProfile, invitation: GroupInvitationView) {
        let invitee = invitation.invited_user.clone();
        let push = PushNotification::new(
            "📨 Nouvelle invitation de groupe",
            format!(
                "{} vous invite à rejoindre \"{}\"",
                inviter.full_name(),
                invitation.group_name
            ),
        )
        .with("type", "group_invitation")
        .with("group_id", invitation.group_id)
        .with("invitation_id", invitation.id);

        self.fanout
            .to_user(&invitee, &ServerFrame::GroupInvitation { invitation })
            .await;
        self.fanout.push(&[invitee], &push).await;
    }

    pub async fn respond_to_invitation(
        &self,
        invitation_id: ObjectId,
        by: &UserId,
        action: InvitationAction,
    ) -> Result<InvitationResponse, ChatError> {
        let now = Utc::now();
        let (invitation, user, joined) = self
            .storage
            .run(Deadline::List, |db| {
                let invitation = db
                    .get_group_invitation(invitation_id)
                    .map_err(on_missing(msg::INVITATION_NOT_FOUND))?;
                if invitation.invited_user != *by {
                    return Err(ChatError::Forbidden(msg::NOT_INVITEE));
                }
                if invitation.status != GroupInvitationStatus::Pending {
                    return Err(ChatError::Conflict(msg::ALREADY_RESPONDED));
                }
                let user = projection::load_profile(db, by).map_err(on_missing(msg::USER_NOT_FOUND))?;
                let group_id = invitation.group_id;

                match action {
                    InvitationAction::Accept => {
                        active_group(db, group_id)?;
                        if db.get_group_member(group_id, by)?.is_some() {
                            return Err(ChatError::Conflict(msg::ALREADY_MEMBER));
                        }
                        let member = GroupMember {
                            group_id,
                            user_id: by.clone(),
                            role: GroupRole::Member,
                            joined_at: now,
                        };
                        let announcement = GroupMessage::system(
                            group_id,
                            format!("{} a rejoint le groupe", user.full_name()),
                        );
                        db.accept_group_invitation(invitation_id, now, &member, &announcement)
                            .map_err(on_conflict(msg::ALREADY_RESPONDED))?;

                        let members = member_ids(db, group_id)?;
                        let announcement = projection::group_message_view(db, &announcement)?;
                        Ok((invitation, user, Some((members, announcement))))
                    }
                    InvitationAction::Reject => {
                        db.close_group_invitation(invitation_id, GroupInvitationStatus::Rejected, now)
                            .map_err(on_conflict(msg::ALREADY_RESPONDED))?;
                        Ok((invitation, user, None))
                    }
                }
            })
            .await?;

        let group_id = invitation.group_id;
        info!(group = %group_id, invitation = %invitation_id, by = %by, action = %action, "group invitation answered");

        let status = match joined {
            Some((members, system_message)) => {
                self.fanout
                    .to_users(
                        &members,
                        &ServerFrame::GroupMemberJoined {
                            group_id,
                            user: user.clone(),
                            system_message,
                        },
                    )
                    .await;
                self.fanout
                    .to_user(
                        &invitation.invited_by,
                        &ServerFrame::GroupInvitationAccepted {
                            invitation_id,
                            group_id,
                            user,
                            accepted_at: now,
                        },
                    )
                    .await;
                GroupInvitationStatus::Accepted
            }
            None => {
                self.fanout
                    .to_user(
                        &invitation.invited_by,
                        &ServerFrame::GroupInvitationRejected {
                            invitation_id,
                            group_id,
                            user,
                            rejected_at: now,
                        },
                    )
                    .await;
                GroupInvitationStatus::Rejected
            }
        };

        Ok(InvitationResponse {
            invitation_id,
            group_id,
            status,
        })
    }

    /// Withdraw a pending invitation. `by` must be an admin of its group.
    pub async fn cancel_invitation(&self, invitation_id: ObjectId, by: &UserId) -> Result<(), ChatError> {
        self.storage
            .run(Deadline::Point, |db| {
                let invitation = db
                    .get_group_invitation(invitation_id)
                    .map_err(on_missing(msg::INVITATION_NOT_FOUND))?;
                require_group_admin(db, invitation.group_id, by)?;
                db.close_group_invitation(invitation_id, GroupInvitationStatus::Cancelled, Utc::now())
                    .map_err(on_conflict(msg::ALREADY_RESPONDED))?;
                Ok(())
            })
            .await?;
        info!(invitation = %invitation_id, by = %by, "group invitation cancelled");
        Ok(())
    }

    pub async fn send_message(
        &self,
        group_id: ObjectId,
        sender_id: &UserId,
        content: &str,
    ) -> Result<GroupMessageView, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation(msg::EMPTY_MESSAGE));
        }

        let (view, group, recipients) = self
            .storage
            .run(Deadline::Point, |db| {
                let group = active_group(db, group_id)?;
                require_member(db, group_id, sender_id)?;

                let message = GroupMessage {
                    id: ObjectId::new(),
                    group_id,
                    sender_id: sender_id.clone(),
                    content: content.to_string(),
                    kind: GroupMessageKind::Message,
                    created_at: Utc::now(),
                };
                db.insert_group_message(&message)?;

                let recipients: Vec<UserId> = member_ids(db, group_id)?
                    .into_iter()
                    .filter(|u| u != sender_id)
                    .collect();
                Ok((projection::group_message_view(db, &message)?, group, recipients))
            })
            .await?;

        self.fanout
            .to_users(
                &recipients,
                &ServerFrame::NewGroupMessage {
                    group_id,
                    message: view.clone(),
                },
            )
            .await;

        let first_name = view
            .sender
            .as_ref()
            .map(|p| p.firstname.clone())
            .unwrap_or_else(|| sender_id.to_string());
        let push = PushNotification::new(
            format!("👥 {}", group.name),
            truncate_body(&format!("{first_name}: {content}")),
        )
        .with("type", "group_message")
        .with("group_id", group_id)
        .with("message_id", view.id);
        self.fanout.push_if_offline(&recipients, &push).await;

        Ok(view)
    }

    /// Up to `limit` messages before `before` (or the newest), oldest first.
    pub async fn list_messages(
        &self,
        group_id: ObjectId,
        by: &UserId,
        limit: Option<u32>,
        before: Option<ObjectId>,
    ) -> Result<Vec<GroupMessageView>, ChatError> {
        let limit = page_size(limit);
        self.storage
            .run(Deadline::List, |db| {
                existing_group(db, group_id)?;
                require_member(db, group_id, by)?;
                let messages = db.list_group_messages(group_id, limit, before)?;
                Ok(projection::group_message_views(db, &messages)?)
            })
            .await
    }

    pub async fn mark_as_read(&self, group_id: ObjectId, by: &UserId) -> Result<DateTime<Utc>, ChatError> {
        self.require_membership(group_id, by).await?;
        self.receipts.mark_as_read(group_id, by).await
    }

    pub async fn unread_count(&self, group_id: ObjectId, by: &UserId) -> Result<u64, ChatError> {
        self.require_membership(group_id, by).await?;
        self.receipts.unread_count(group_id, by).await
    }

    async fn require_membership(&self, group_id: ObjectId, user: &UserId) -> Result<(), ChatError> {
        self.storage
            .run(Deadline::Point, |db| {
                existing_group(db, group_id)?;
                require_member(db, group_id, user)?;
                Ok(())
            })
            .await
    }

    /// Remove `by` from the group. The earliest-joined member inherits the
    /// admin role when the last admin leaves; an emptied group is
    /// deactivated.
    pub async fn leave_group(&self, group_id: ObjectId, by: &UserId) -> Result<(), ChatError> {
        let (outcome, remaining, farewell) = self
            .storage
            .run(Deadline::List, |db| {
                existing_group(db, group_id)?;
                require_member(db, group_id, by)?;
                let leaver = projection::profile_or_email(db, by)?;
                let farewell = GroupMessage::system(group_id, format!("{} a quitté le groupe", leaver.full_name()));

                let outcome = db
                    .leave_group(group_id, by, Utc::now(), &farewell)
                    .map_err(on_missing(msg::NOT_MEMBER))?;
                let remaining = member_ids(db, group_id)?;
                let farewell = if outcome.remaining > 0 {
                    Some(projection::group_message_view(db, &farewell)?)
                } else {
                    None
                };
                Ok((outcome, remaining, farewell))
            })
            .await?;

        info!(
            group = %group_id,
            user = %by,
            remaining = outcome.remaining,
            deactivated = outcome.deactivated,
            "member left group"
        );
        self.fanout.drop_from_room(Room::Group(group_id), by).await;

        self.fanout
            .to_users(
                &remaining,
                &ServerFrame::GroupMemberLeft {
                    group_id,
                    user_id: by.clone(),
                    system_message: farewell,
                },
            )
            .await;

        if let Some(heir) = outcome.promoted {
            info!(group = %group_id, user = %heir, "member promoted to group admin");
            self.fanout
                .to_user(
                    &heir,
                    &ServerFrame::AdminRightsChanged {
                        user_email: heir.clone(),
                        admin: true,
                        group_id: Some(group_id),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Active groups of `user`, most recently updated first.
    pub async fn list_groups(&self, user: &UserId) -> Result<Vec<GroupSummary>, ChatError> {
        self.storage
            .run(Deadline::Aggregate, |db| {
                let mut summaries = Vec::new();
                for group in db.list_groups_for_user(user)? {
                    let unread_count = unread_in(db, group.id, user)?;
                    let last_message = db
                        .latest_group_message(group.id)?
                        .map(|m| projection::group_preview(&m, unread_count == 0));
                    summaries.push(GroupSummary {
                        id: group.id,
                        created_by: projection::profile_or_email(db, &group.created_by)?,
                        name: group.name,
                        created_at: group.created_at,
                        member_count: db.count_group_members(group.id)?,
                        unread_count,
                        last_message,
                    });
                }
                Ok(summaries)
            })
            .await
    }

    pub async fn list_members(&self, group_id: ObjectId, by: &UserId) -> Result<Vec<GroupMemberView>, ChatError> {
        let mut members = self
            .storage
            .run(Deadline::List, |db| {
                existing_group(db, group_id)?;
                require_member(db, group_id, by)?;
                let mut views = Vec::new();
                for member in db.list_group_members(group_id)? {
                    views.push(GroupMemberView {
                        profile: projection::profile_or_email(db, &member.user_id)?,
                        role: member.role,
                        joined_at: member.joined_at,
                        is_online: false,
                    });
                }
                Ok(views)
            })
            .await?;

        for member in &mut members {
            member.is_online = self.presence.is_online(&member.profile.id).await;
        }
        Ok(members)
    }

    /// Pending invitations addressed to `user`.
    pub async fn list_pending_invitations(&self, user: &UserId) -> Result<Vec<GroupInvitationView>, ChatError> {
        self.storage
            .run(Deadline::List, |db| {
                let invitations = db.list_pending_group_invitations_for_user(user)?;
                invitation_views(db, &invitations)
            })
            .await
    }

    /// Pending invitations of one group. Group admins only.
    pub async fn list_group_pending_invitations(
        &self,
        group_id: ObjectId,
        by: &UserId,
    ) -> Result<Vec<GroupInvitationView>, ChatError> {
        self.storage
            .run(Deadline::List, |db| {
                existing_group(db, group_id)?;
                require_group_admin(db, group_id, by)?;
                let invitations = db.list_pending_group_invitations(group_id)?;
                invitation_views(db, &invitations)
            })
            .await
    }

    /// Users matching `query` by name or email, excluding the caller.
    pub async fn search_users(
        &self,
        caller: &UserId,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<UserProfile>, ChatError> {
        let query = query.trim();
        if query.chars().count() < MIN_SEARCH_QUERY_CHARS {
            return Err(ChatError::Validation(msg::SEARCH_TOO_SHORT));
        }
        let limit = search_size(limit);
        self.storage
            .run(Deadline::List, |db| {
                Ok(db
                    .search_users(query, limit, Some(caller), false)?
                    .iter()
                    .map(projection::profile)
                    .collect())
            })
            .await
    }
}

fn pending_invitation(
    group_id: ObjectId,
    by: &UserId,
    invitee: &UserId,
    message: Option<String>,
) -> GroupInvitation {
    GroupInvitation {
        id: ObjectId::new(),
        group_id,
        invited_by: by.clone(),
        invited_user: invitee.clone(),
        message,
        status: GroupInvitationStatus::Pending,
        invited_at: Utc::now(),
        responded_at: None,
    }
}

fn existing_group(db: &Database, group_id: ObjectId) -> Result<ChatGroup, ChatError> {
    db.get_group(group_id).map_err(on_missing(msg::GROUP_NOT_FOUND))
}

fn active_group(db: &Database, group_id: ObjectId) -> Result<ChatGroup, ChatError> {
    let group = existing_group(db, group_id)?;
    if !group.is_active {
        return Err(ChatError::NotFound(msg::GROUP_NOT_FOUND));
    }
    Ok(group)
}

fn require_member(db: &Database, group_id: ObjectId, user: &UserId) -> Result<GroupMember, ChatError> {
    db.get_group_member(group_id, user)?
        .ok_or(ChatError::Forbidden(msg::NOT_MEMBER))
}

fn require_group_admin(db: &Database, group_id: ObjectId, user: &UserId) -> Result<GroupMember, ChatError> {
    let member = require_member(db, group_id, user)?;
    if !member.is_admin() {
        return Err(ChatError::Forbidden(msg::NOT_GROUP_ADMIN));
    }
    Ok(member)
}

fn member_ids(db: &Database, group_id: ObjectId) -> Result<Vec<UserId>, ChatError> {
    Ok(db
        .list_group_members(group_id)?
        .into_iter()
        .map(|m| m.user_id)
        .collect())
}

fn invitation_views(db: &Database, invitations: &[GroupInvitation]) -> Result<Vec<GroupInvitationView>, ChatError> {
    let mut views = Vec::with_capacity(invitations.len());
    for invitation in invitations {
        views.push(projection::group_invitation_view(db, invitation)?);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::TestEnv;

    fn ids(emails: &[&str]) -> Vec<UserId> {
        emails.iter().map(|e| UserId::parse(e).unwrap()).collect()
    }

    async fn accept(env: &TestEnv, group: ObjectId, user: &UserId) {
        let pending = env.groups.list_pending_invitations(user).await.unwrap();
        let invitation = pending.iter().find(|i| i.group_id == group).unwrap();
        env.groups
            .respond_to_invitation(invitation.id, user, InvitationAction::Accept)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_group_invites_existing_users() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let d = env.add_user("d@x.com", "David", false).await;
        env.add_user("e@x.com", "Emma", false).await;
        let mut sc = env.connect(&c).await;
        let mut sd = env.connect(&d).await;

        let group = env
            .groups
            .create_group(&c, " Bureau ", &ids(&["d@x.com", "e@x.com", "ghost@x.com", "c@x.com"]))
            .await
            .unwrap();
        assert_eq!(group.name, "Bureau");
        assert_eq!(group.member_count, 1);

        let members = env.groups.list_members(group.id, &c).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, GroupRole::Admin);

        let pending = env.groups.list_group_pending_invitations(group.id, &c).await.unwrap();
        assert_eq!(pending.len(), 2);

        assert!(matches!(TestEnv::drain(&mut sc).as_slice(), [ServerFrame::GroupCreated { .. }]));
        assert!(matches!(
            TestEnv::drain(&mut sd).as_slice(),
            [ServerFrame::GroupInvitation { invitation }] if invitation.group_name == "Bureau"
        ));

        let pushed = env.push.sent();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].1.title, "📨 Nouvelle invitation de groupe");
        assert_eq!(pushed[0].1.body, "Claire Test vous invite à rejoindre \"Bureau\"");
        assert_eq!(pushed[0].1.data["type"], "group_invitation");
    }

    #[tokio::test]
    async fn blank_group_names_are_rejected() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let err = env.groups.create_group(&c, "  ", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn accepting_adds_member_and_announces() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let d = env.add_user("d@x.com", "David", false).await;
        let group = env.groups.create_group(&c, "Bureau", &[d.clone()]).await.unwrap();
        let invitation = env.groups.list_pending_invitations(&d).await.unwrap().remove(0);
        let mut sc = env.connect(&c).await;
        let mut sd = env.connect(&d).await;

        let response = env
            .groups
            .respond_to_invitation(invitation.id, &d, InvitationAction::Accept)
            .await
            .unwrap();
        assert_eq!(response.status, GroupInvitationStatus::Accepted);

        let frames_c = TestEnv::drain(&mut sc);
        assert_eq!(frames_c.len(), 2);
        match &frames_c[0] {
            ServerFrame::GroupMemberJoined { system_message, user, .. } => {
                assert_eq!(system_message.content, "David Test a rejoint le groupe");
                assert_eq!(system_message.message_type, GroupMessageKind::System);
                assert!(system_message.sender.is_none());
                assert_eq!(user.email, d);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(frames_c[1], ServerFrame::GroupInvitationAccepted { .. }));
        assert!(matches!(
            TestEnv::drain(&mut sd).as_slice(),
            [ServerFrame::GroupMemberJoined { .. }]
        ));

        let members = env.groups.list_members(group.id, &d).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.is_online));

        let history = env.groups.list_messages(group.id, &d, None, None).await.unwrap();
        assert_eq!(history.len(), 1);

        let err = env
            .groups
            .respond_to_invitation(invitation.id, &d, InvitationAction::Accept)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn rejecting_only_notifies_the_inviter() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let d = env.add_user("d@x.com", "David", false).await;
        let group = env.groups.create_group(&c, "Bureau", &[d.clone()]).await.unwrap();
        let invitation = env.groups.list_pending_invitations(&d).await.unwrap().remove(0);
        let mut sc = env.connect(&c).await;

        let err = env
            .groups
            .respond_to_invitation(invitation.id, &c, InvitationAction::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        env.groups
            .respond_to_invitation(invitation.id, &d, InvitationAction::Reject)
            .await
            .unwrap();
        assert!(matches!(
            TestEnv::drain(&mut sc).as_slice(),
            [ServerFrame::GroupInvitationRejected { .. }]
        ));
        assert_eq!(env.groups.list_members(group.id, &c).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invite_guards() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let d = env.add_user("d@x.com", "David", false).await;
        let e = env.add_user("e@x.com", "Emma", false).await;
        let group = env.groups.create_group(&c, "Bureau", &[d.clone()]).await.unwrap();

        let err = env.groups.invite(group.id, &c, &d, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        accept(&env, group.id, &d).await;
        let err = env.groups.invite(group.id, &c, &d, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = env.groups.invite(group.id, &d, &e, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let view = env
            .groups
            .invite(group.id, &c, &e, Some("viens !".into()))
            .await
            .unwrap();
        assert_eq!(view.message.as_deref(), Some("viens !"));

        let err = env.groups.cancel_invitation(view.id, &d).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        env.groups.cancel_invitation(view.id, &c).await.unwrap();
        assert!(env.groups.list_pending_invitations(&e).await.unwrap().is_empty());
        let err = env.groups.cancel_invitation(view.id, &c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn messages_reach_members_and_offline_push() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let d = env.add_user("d@x.com", "David", false).await;
        let e = env.add_user("e@x.com", "Emma", false).await;
        let group = env.groups.create_group(&c, "Bureau", &[d.clone(), e.clone()]).await.unwrap();
        accept(&env, group.id, &d).await;
        accept(&env, group.id, &e).await;
        let mut sc = env.connect(&c).await;
        let mut sd = env.connect(&d).await;
        env.push.clear();

        let view = env.groups.send_message(group.id, &c, "réunion à 10h").await.unwrap();
        assert_eq!(view.sender.as_ref().unwrap().firstname, "Claire");

        assert!(TestEnv::drain(&mut sc).is_empty());
        assert!(matches!(
            TestEnv::drain(&mut sd).as_slice(),
            [ServerFrame::NewGroupMessage { message, .. }] if message.id == view.id
        ));

        let pushed = env.push.sent();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, vec!["device:e@x.com".to_string()]);
        assert_eq!(pushed[0].1.title, "👥 Bureau");
        assert_eq!(pushed[0].1.body, "Claire: réunion à 10h");

        let outsider = env.add_user("o@x.com", "Oscar", false).await;
        let err = env.groups.send_message(group.id, &outsider, "hey").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = env.groups.send_message(group.id, &c, " ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn history_pages_backwards() {
        let env = TestEnv::new().await;
        let c = env.add_user("c@x.com", "Claire", false).await;
        let group = env.add_group("Bureau", &c, &[]).await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(env.post(group, &c, &format!("m{i}")).await);
        }

        let newest = env.groups.list_messages(group, &c, Some(2), None).await.unwrap();
        assert_eq!(newest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

        let older = env.groups.list_messages(group, &c, Some(2), Some(ids[3])).await.unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());

        env.post(group, &c, "later").await;
        let again = env.groups.list_messages(group, &c, Some(2), Some(ids[3])).await.unwrap();
        assert_eq!(again, older);
    }

    #[tokio::test]
    async fn unread_counts_follow_reads() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let u = env.add_user("u@x.com", "Ugo", false).await;
        let group = env.add_group("Bureau", &a, &[&u]).await;
        for text in ["1", "2", "3"] {
            env.post(group, &a, text).await;
        }

        assert_eq!(env.groups.unread_count(group, &u).await.unwrap(), 3);
        env.groups.mark_as_read(group, &u).await.unwrap();
        assert_eq!(env.groups.unread_count(group, &u).await.unwrap(), 0);

        env.post(group, &a, "4").await;
        env.post(group, &a, "5").await;
        assert_eq!(env.groups.unread_count(group, &u).await.unwrap(), 2);
        let listed = env.groups.list_groups(&u).await.unwrap();
        assert_eq!(listed[0].unread_count, 2);
        assert_eq!(listed[0].member_count, 2);
        assert!(!listed[0].last_message.as_ref().unwrap().is_read);

        env.groups.mark_as_read(group, &u).await.unwrap();
        env.groups.mark_as_read(group, &u).await.unwrap();
        assert_eq!(env.groups.unread_count(group, &u).await.unwrap(), 0);

        let outsider = env.add_user("o@x.com", "Oscar", false).await;
        let err = env.groups.unread_count(group, &outsider).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn last_admin_leaving_promotes_earliest_member() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        let c = env.add_user("c@x.com", "Chloé", false).await;
        let group = env.add_group("Bureau", &a, &[&b, &c]).await;
        let mut sb = env.connect(&b).await;
        let mut sc = env.connect(&c).await;

        env.groups.leave_group(group, &a).await.unwrap();

        let members = env.groups.list_members(group, &b).await.unwrap();
        let roles: Vec<(UserId, GroupRole)> = members.iter().map(|m| (m.profile.id.clone(), m.role)).collect();
        assert_eq!(roles, vec![(b.clone(), GroupRole::Admin), (c.clone(), GroupRole::Member)]);

        let frames_b = TestEnv::drain(&mut sb);
        assert_eq!(frames_b.len(), 2);
        assert!(matches!(
            &frames_b[0],
            ServerFrame::GroupMemberLeft { system_message: Some(m), .. } if m.content == "Anne Test a quitté le groupe"
        ));
        assert!(matches!(
            &frames_b[1],
            ServerFrame::AdminRightsChanged { admin: true, group_id: Some(g), .. } if *g == group
        ));
        assert_eq!(TestEnv::drain(&mut sc).len(), 1);

        let err = env.groups.leave_group(group, &a).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn last_member_leaving_deactivates() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let group = env.add_group("Solo", &a, &[]).await;

        env.groups.leave_group(group, &a).await.unwrap();
        assert!(env.groups.list_groups(&a).await.unwrap().is_empty());
        let b = env.add_user("b@x.com", "Bruno", false).await;
        let err = env.groups.invite(group, &a, &b, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn search_requires_two_chars_and_skips_caller() {
        let env = TestEnv::new().await;
        let a = env.add_user("alice@x.com", "Alice", false).await;
        env.add_user("albert@x.com", "Albert", false).await;

        let err = env.groups.search_users(&a, " a ", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let found = env.groups.search_users(&a, "al", None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].firstname, "Albert");
    }

    #[tokio::test]
    async fn read_receipt_is_room_scoped() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        let group = env.add_group("Bureau", &a, &[&b]).await;
        let mut sa = env.connect(&a).await;

        env.groups.mark_as_read(group, &b).await.unwrap();
        assert!(TestEnv::drain(&mut sa).is_empty());

        env.hub.join_room(Room::Group(group), &a).await;
        env.groups.mark_as_read(group, &b).await.unwrap();
        assert_eq!(TestEnv::drain(&mut sa).len(), 1);
    }

    #[tokio::test]
    async fn leaving_detaches_from_the_group_room() {
        let env = TestEnv::new().await;
        let a = env.add_user("a@x.com", "Anne", false).await;
        let b = env.add_user("b@x.com", "Bruno", false).await;
        let c = env.add_user("c@x.com", "Chloé", false).await;
        let group = env.add_group("Bureau", &a, &[&b, &c]).await;
        let room = Room::Group(group);
        let mut sb = env.connect(&b).await;
        env.hub.join_room(room, &b).await;

        env.groups.leave_group(group, &b).await.unwrap();
        assert!(!env.hub.room_members(room).await.contains(&b));
        TestEnv::drain(&mut sb);

        env.groups.mark_as_read(group, &c).await.unwrap();
        assert!(TestEnv::drain(&mut sb).is_empty());
    }
}
