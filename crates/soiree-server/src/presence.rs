//! Online/offline tracking with an idle timeout.
//!
//! A user goes online when a session registers or a `user_presence`
//! heartbeat arrives, and offline on disconnect, on an explicit
//! `is_online: false` heartbeat, or when no heartbeat arrived for the idle
//! timeout. Each online user owns exactly one timer task; a heartbeat
//! cancels it and arms a replacement.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use soiree_shared::protocol::ServerFrame;
use soiree_shared::UserId;

use crate::hub::ConnectionHub;
use crate::storage::{Deadline, Storage};

/// Read-only presence capability handed to the services.
#[async_trait]
pub trait PresenceView: Send + Sync {
    async fn is_online(&self, user: &UserId) -> bool;
}

struct PresenceEntry {
    online: bool,
    timer: Option<JoinHandle<()>>,
    /// Identifies the armed timer; a firing timer with a stale generation
    /// was replaced and does nothing.
    generation: u64,
    last_heartbeat_at: DateTime<Utc>,
}

pub struct PresenceTracker {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
    hub: Arc<ConnectionHub>,
    storage: Option<Storage>,
    idle_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(hub: Arc<ConnectionHub>, storage: Option<Storage>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            hub,
            storage,
            idle_timeout,
        })
    }

    /// A session of `user` registered with the hub.
    pub async fn connected(self: &Arc<Self>, user: &UserId) {
        self.mark_online(user).await;
    }

    /// `user_presence` frame from a session.
    pub async fn heartbeat(self: &Arc<Self>, user: &UserId, is_online: bool) {
        if is_online {
            self.mark_online(user).await;
        } else {
            self.mark_offline(user).await;
        }
    }

    /// A session of `user` closed. Does nothing when another session of
    /// theirs is registered by the time the entry lock is held.
    pub async fn disconnected(&self, user: &UserId) {
        let went_offline = {
            let mut entries = self.entries.lock().await;
            if self.hub.is_connected(user).await {
                debug!(user = %user, "session closed but user still connected");
                return;
            }
            self.drop_entry(&mut entries, user).await
        };

        if let Some(at) = went_offline {
            self.persist_last_seen(user, at).await;
        }
    }

    async fn mark_online(self: &Arc<Self>, user: &UserId) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(user.clone()).or_insert_with(|| PresenceEntry {
            online: false,
            timer: None,
            generation: 0,
            last_heartbeat_at: Utc::now(),
        });

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.generation += 1;
        entry.last_heartbeat_at = Utc::now();
        entry.timer = Some(self.arm_timer(user.clone(), entry.generation));

        // Announced under the lock so it cannot overtake an offline update.
        if !entry.online {
            entry.online = true;
            debug!(user = %user, "user online");
            self.announce(user, true, None).await;
        }
    }

    async fn mark_offline(&self, user: &UserId) {
        let went_offline = {
            let mut entries = self.entries.lock().await;
            self.drop_entry(&mut entries, user).await
        };

        if let Some(at) = went_offline {
            self.persist_last_seen(user, at).await;
        }
    }

    /// Forget `user` and announce them offline if they were online. Returns
    /// the offline instant for `last_seen`.
    async fn drop_entry(&self, entries: &mut HashMap<UserId, PresenceEntry>, user: &UserId) -> Option<DateTime<Utc>> {
        let entry = entries.remove(user)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        if !entry.online {
            return None;
        }
        let now = Utc::now();
        self.announce(user, false, Some(now)).await;
        Some(now)
    }

    fn arm_timer(self: &Arc<Self>, user: UserId, generation: u64) -> JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let idle = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(&user, generation).await;
            }
        })
    }

    async fn expire(&self, user: &UserId, generation: u64) {
        let was_online = {
            let mut entries = self.entries.lock().await;
            if entries.get(user).map(|e| e.generation) != Some(generation) {
                return;
            }
            entries.remove(user).is_some_and(|entry| entry.online)
        };

        if was_online {
            debug!(user = %user, idle_secs = self.idle_timeout.as_secs(), "presence timed out");
            self.went_offline(user).await;
        }
    }

    async fn went_offline(&self, user: &UserId) {
        let now = Utc::now();
        self.persist_last_seen(user, now).await;
        self.announce(user, false, Some(now)).await;
    }

    async fn persist_last_seen(&self, user: &UserId, at: DateTime<Utc>) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = storage
            .run(Deadline::Point, |db| Ok(db.update_last_seen(user, at)?))
            .await
        {
            warn!(user = %user, error = %e, "failed to persist last_seen");
        }
    }

    async fn announce(&self, user: &UserId, is_online: bool, last_seen: Option<DateTime<Utc>>) {
        let frame = ServerFrame::PresenceUpdate {
            user_id: user.clone(),
            is_online,
            last_seen,
        };
        self.hub.broadcast(&frame, |other| other != user).await;
    }

    /// Drop entries whose timer is missing or already finished.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.timer.as_ref().is_some_and(|t| !t.is_finished()));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "presence sweep");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `period` for as long as the tracker
    /// is alive.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.sweep().await;
            }
        })
    }

    /// Mark every online user offline and announce it.
    pub async fn shutdown(&self) {
        let online: Vec<UserId> = {
            let mut entries = self.entries.lock().await;
            entries
                .drain()
                .filter_map(|(user, entry)| {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                    entry.online.then_some(user)
                })
                .collect()
        };

        info!(users = online.len(), "presence shutdown");
        for user in &online {
            self.went_offline(user).await;
        }
    }

    pub async fn online_count(&self) -> usize {
        self.entries.lock().await.values().filter(|e| e.online).count()
    }

    /// When `user` last sent a heartbeat, if they are tracked.
    pub async fn last_heartbeat(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(user).map(|e| e.last_heartbeat_at)
    }
}

#[async_trait]
impl PresenceView for PresenceTracker {
    async fn is_online(&self, user: &UserId) -> bool {
        self.entries.lock().await.get(user).is_some_and(|e| e.online)
    }
}
