//! Shared fixtures for the server's unit tests.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use soiree_shared::protocol::ServerFrame;
use soiree_shared::types::{GroupMessageKind, GroupRole};
use soiree_shared::{ObjectId, UserId};
use soiree_store::{ChatGroup, GroupMember, GroupMessage, PushToken, User};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::{SessionChannels, SessionHandle};
use crate::push::{PushError, PushNotification, PushReport, PushSink};
use crate::storage::{Deadline, Storage};

pub(crate) const TEST_SECRET: &str = "test-secret";

/// Records every batch instead of delivering it.
#[derive(Default)]
pub(crate) struct RecordingPush {
    sent: Mutex<Vec<(Vec<String>, PushNotification)>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<(Vec<String>, PushNotification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Report `token` as invalid from now on.
    pub fn reject(&self, token: &str) {
        self.rejected.lock().unwrap().insert(token.to_string());
    }
}

#[async_trait]
impl PushSink for RecordingPush {
    async fn send_to_all(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushReport, PushError> {
        self.sent
            .lock()
            .unwrap()
            .push((tokens.to_vec(), notification.clone()));
        let rejected = self.rejected.lock().unwrap();
        let failed_tokens: Vec<String> = tokens.iter().filter(|t| rejected.contains(*t)).cloned().collect();
        Ok(PushReport {
            success_count: tokens.len() - failed_tokens.len(),
            failure_count: failed_tokens.len(),
            failed_tokens,
        })
    }
}

/// A fully wired application over a throwaway database.
pub(crate) struct TestEnv {
    _dir: TempDir,
    pub state: AppState,
    pub push: Arc<RecordingPush>,
}

impl Deref for TestEnv {
    type Target = AppState;

    fn deref(&self) -> &AppState {
        &self.state
    }
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("chat.db"),
            jwt_secret: Some(TEST_SECRET.into()),
            ..ServerConfig::default()
        };
        let storage = Storage::open(&config.database_path).unwrap();
        let push = Arc::new(RecordingPush::default());
        let state = AppState::new(config, TEST_SECRET, storage, push.clone());
        Self {
            _dir: dir,
            state,
            push,
        }
    }

    /// Insert a user named `<firstname> Test` with one push device.
    pub async fn add_user(&self, email: &str, firstname: &str, is_admin: bool) -> UserId {
        let id = UserId::parse(email).unwrap();
        let user = User {
            email: id.clone(),
            firstname: firstname.into(),
            lastname: "Test".into(),
            is_admin,
            last_seen: None,
            created_at: Utc::now(),
        };
        let token = PushToken {
            token: format!("device:{id}"),
            user_id: id.clone(),
            device: None,
            user_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.storage
            .run(Deadline::Point, |db| {
                db.insert_user(&user)?;
                db.upsert_push_token(&token)?;
                Ok(())
            })
            .await
            .unwrap();
        id
    }

    /// Register a bare session for `user` and mark them online.
    pub async fn connect(&self, user: &UserId) -> SessionChannels {
        let (handle, channels) = SessionHandle::new(user.clone());
        self.hub.register(handle).await;
        self.presence.connected(user).await;
        channels
    }

    /// Frames queued for a session, presence updates left out.
    pub fn drain(channels: &mut SessionChannels) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(payload) = channels.outbound.try_recv() {
            let frame = ServerFrame::from_json(&payload).unwrap();
            if !matches!(frame, ServerFrame::PresenceUpdate { .. }) {
                frames.push(frame);
            }
        }
        frames
    }

    /// A group created directly in the store, members already joined.
    pub async fn add_group(&self, name: &str, creator: &UserId, members: &[&UserId]) -> ObjectId {
        let now = Utc::now();
        let group = ChatGroup {
            id: ObjectId::new(),
            name: name.into(),
            created_by: creator.clone(),
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        self.storage
            .run(Deadline::Point, |db| {
                db.create_group(
                    &group,
                    &GroupMember {
                        group_id: group.id,
                        user_id: creator.clone(),
                        role: GroupRole::Admin,
                        joined_at: now,
                    },
                )?;
                for member in members {
                    db.add_group_member(&GroupMember {
                        group_id: group.id,
                        user_id: (*member).clone(),
                        role: GroupRole::Member,
                        joined_at: Utc::now(),
                    })?;
                }
                Ok(())
            })
            .await
            .unwrap();
        group.id
    }

    /// Persist a message without any fan-out.
    pub async fn post(&self, group_id: ObjectId, sender: &UserId, text: &str) -> ObjectId {
        let message = GroupMessage {
            id: ObjectId::new(),
            group_id,
            sender_id: sender.clone(),
            content: text.into(),
            kind: GroupMessageKind::Message,
            created_at: Utc::now(),
        };
        self.storage
            .run(Deadline::Point, |db| Ok(db.insert_group_message(&message)?))
            .await
            .unwrap();
        message.id
    }
}
