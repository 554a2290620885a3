//! Process-wide registry of live sessions and their rooms.
//!
//! One session per user. All enqueues are non-blocking: a session whose
//! outbound buffer is full (or already closed) is evicted, and delivery
//! continues with the remaining recipients.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use soiree_shared::constants::SEND_BUFFER_CAPACITY;
use soiree_shared::protocol::ServerFrame;
use soiree_shared::UserId;

use crate::rooms::{Room, RoomRegistry};

/// Why the hub closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer session of the same user registered.
    Replaced,
    /// The outbound buffer overflowed.
    SlowConsumer,
    Disconnected,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Shutdown => "server shutdown",
        }
    }

    /// WebSocket close code sent to the client.
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Replaced => 4000,
            CloseReason::SlowConsumer => 1008,
            CloseReason::Disconnected => 1000,
            CloseReason::Shutdown => 1001,
        }
    }
}

/// The hub's side of a session: where to enqueue, and how to close it.
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: UserId,
    outbound: mpsc::Sender<Arc<str>>,
    close: watch::Sender<Option<CloseReason>>,
}

/// The session task's side of a [`SessionHandle`].
pub struct SessionChannels {
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl SessionHandle {
    pub fn new(user_id: UserId) -> (Self, SessionChannels) {
        Self::with_capacity(user_id, SEND_BUFFER_CAPACITY)
    }

    pub fn with_capacity(user_id: UserId, capacity: usize) -> (Self, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            id: Uuid::new_v4(),
            user_id,
            outbound: outbound_tx,
            close: close_tx,
        };
        let channels = SessionChannels {
            outbound: outbound_rx,
            close: close_rx,
        };
        (handle, channels)
    }

    fn close(&self, reason: CloseReason) {
        self.close.send_replace(Some(reason));
    }
}

struct HubState {
    connections: HashMap<UserId, SessionHandle>,
    rooms: RoomRegistry,
}

pub struct ConnectionHub {
    state: RwLock<HubState>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HubState {
                connections: HashMap::new(),
                rooms: RoomRegistry::new(),
            }),
        }
    }

    /// Register a session, displacing any older session of the same user.
    pub async fn register(&self, session: SessionHandle) {
        let user = session.user_id.clone();
        let id = session.id;
        let mut state = self.state.write().await;

        if let Some(previous) = state.connections.insert(user.clone(), session) {
            if previous.id != id {
                previous.close(CloseReason::Replaced);
                let released = state.rooms.release_user(&user);
                info!(user = %user, old = %previous.id, new = %id, released, "session replaced");
                return;
            }
        }
        info!(user = %user, session = %id, connections = state.connections.len(), "session registered");
    }

    /// Remove the session `session_id` of `user` if it is still the current
    /// one. Returns whether anything was removed.
    pub async fn unregister(&self, session_id: Uuid, user: &UserId) -> bool {
        let mut state = self.state.write().await;
        if !state
            .connections
            .get(user)
            .is_some_and(|current| current.id == session_id)
        {
            return false;
        }

        if let Some(session) = state.connections.remove(user) {
            session.close(CloseReason::Disconnected);
        }
        let released = state.rooms.release_user(user);
        info!(user = %user, session = %session_id, released, "session unregistered");
        true
    }

    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.state.read().await.connections.contains_key(user)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn join_room(&self, room: Room, user: &UserId) -> bool {
        let joined = self.state.write().await.rooms.join(room, user);
        debug!(user = %user, ?room, joined, "room join");
        joined
    }

    pub async fn leave_room(&self, room: Room, user: &UserId) -> bool {
        let left = self.state.write().await.rooms.leave(room, user);
        debug!(user = %user, ?room, left, "room leave");
        left
    }

    pub async fn room_members(&self, room: Room) -> Vec<UserId> {
        self.state.read().await.rooms.members(room)
    }

    pub async fn in_room(&self, room: Room, user: &UserId) -> bool {
        self.state.read().await.rooms.contains(room, user)
    }

    /// Enqueue `frame` for `user`. A no-op when the user is not connected.
    pub async fn send_to_user(&self, user: &UserId, frame: &ServerFrame) {
        self.send_to_users(std::slice::from_ref(user), frame).await;
    }

    /// Enqueue `frame` for every listed user, serializing it once.
    pub async fn send_to_users(&self, users: &[UserId], frame: &ServerFrame) {
        let Some(payload) = encode(frame) else {
            return;
        };
        let failed = {
            let state = self.state.read().await;
            enqueue(&state, users.iter(), &payload)
        };
        self.evict(failed).await;
    }

    /// Enqueue `frame` for every member of `room` except `exclude`.
    pub async fn send_to_room(&self, room: Room, frame: &ServerFrame, exclude: Option<&UserId>) {
        let Some(payload) = encode(frame) else {
            return;
        };
        let failed = {
            let state = self.state.read().await;
            let members = state.rooms.members(room);
            let targets = members.iter().filter(|u| Some(*u) != exclude);
            enqueue(&state, targets, &payload)
        };
        self.evict(failed).await;
    }

    /// Enqueue `frame` for every connected user matching `predicate`.
    pub(crate) async fn broadcast<P>(&self, frame: &ServerFrame, predicate: P)
    where
        P: Fn(&UserId) -> bool,
    {
        let Some(payload) = encode(frame) else {
            return;
        };
        let failed = {
            let state = self.state.read().await;
            let targets: Vec<&UserId> = state.connections.keys().filter(|u| predicate(*u)).collect();
            enqueue(&state, targets.into_iter(), &payload)
        };
        self.evict(failed).await;
    }

    /// Close every session, e.g. on shutdown.
    pub async fn close_all(&self, reason: CloseReason) {
        let mut state = self.state.write().await;
        for (_, session) in state.connections.drain() {
            session.close(reason);
        }
        state.rooms.clear();
        info!(reason = reason.as_str(), "closed all sessions");
    }

    async fn evict(&self, failed: Vec<(UserId, Uuid)>) {
        if failed.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for (user, session_id) in failed {
            // The user may have reconnected in between.
            if !state
                .connections
                .get(&user)
                .is_some_and(|current| current.id == session_id)
            {
                continue;
            }
            if let Some(session) = state.connections.remove(&user) {
                session.close(CloseReason::SlowConsumer);
            }
            state.rooms.release_user(&user);
            warn!(user = %user, session = %session_id, "evicted slow consumer");
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<Arc<str>> {
    match frame.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(kind = frame.kind(), error = %e, "failed to encode frame");
            None
        }
    }
}

fn enqueue<'a>(
    state: &HubState,
    targets: impl Iterator<Item = &'a UserId>,
    payload: &Arc<str>,
) -> Vec<(UserId, Uuid)> {
    let mut failed = Vec::new();
    for user in targets {
        let Some(session) = state.connections.get(user) else {
            continue;
        };
        if session.outbound.try_send(payload.clone()).is_err() {
            failed.push((user.clone(), session.id));
        }
    }
    failed
}

/// Live delivery capability handed to the services.
#[async_trait]
pub trait Realtime: Send + Sync {
    async fn send_to_users(&self, users: &[UserId], frame: &ServerFrame);

    async fn send_to_room(&self, room: Room, frame: &ServerFrame, exclude: Option<&UserId>);

    /// Stop delivering `room` signals to `user`.
    async fn leave_room(&self, room: Room, user: &UserId);
}

#[async_trait]
impl Realtime for ConnectionHub {
    async fn send_to_users(&self, users: &[UserId], frame: &ServerFrame) {
        ConnectionHub::send_to_users(self, users, frame).await
    }

    async fn send_to_room(&self, room: Room, frame: &ServerFrame, exclude: Option<&UserId>) {
        ConnectionHub::send_to_room(self, room, frame, exclude).await
    }

    async fn leave_room(&self, room: Room, user: &UserId) {
        ConnectionHub::leave_room(self, room, user).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soiree_shared::ObjectId;

    fn user(email: &str) -> UserId {
        UserId::parse(email).unwrap()
    }

    fn ping_frame(text: &str) -> ServerFrame {
        ServerFrame::Error {
            message: text.to_string(),
        }
    }

    fn received(channels: &mut SessionChannels) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(payload) = channels.outbound.try_recv() {
            frames.push(ServerFrame::from_json(&payload).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn send_to_absent_user_is_noop() {
        let hub = ConnectionHub::new();
        hub.send_to_user(&user("ghost@x.com"), &ping_frame("hi")).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_session() {
        let hub = ConnectionHub::new();
        let a = user("a@x.com");
        let group = Room::Group(ObjectId::new());

        let (first, mut first_rx) = SessionHandle::new(a.clone());
        let first_id = first.id;
        hub.register(first).await;
        hub.join_room(group, &a).await;

        let (second, mut second_rx) = SessionHandle::new(a.clone());
        hub.register(second).await;

        assert_eq!(*first_rx.close.borrow(), Some(CloseReason::Replaced));
        assert!(hub.room_members(group).await.is_empty());

        // The stale session's cleanup must not remove the new one.
        assert!(!hub.unregister(first_id, &a).await);
        assert!(hub.is_connected(&a).await);

        hub.send_to_user(&a, &ping_frame("hi")).await;
        assert!(received(&mut first_rx).is_empty());
        assert_eq!(received(&mut second_rx).len(), 1);
    }

    #[tokio::test]
    async fn room_delivery_excludes_sender() {
        let hub = ConnectionHub::new();
        let (a, b) = (user("a@x.com"), user("b@x.com"));
        let room = Room::Conversation(ObjectId::new());

        let (ha, mut ra) = SessionHandle::new(a.clone());
        let (hb, mut rb) = SessionHandle::new(b.clone());
        hub.register(ha).await;
        hub.register(hb).await;
        hub.join_room(room, &a).await;
        hub.join_room(room, &b).await;

        hub.send_to_room(room, &ping_frame("typing"), Some(&a)).await;
        assert!(received(&mut ra).is_empty());
        assert_eq!(received(&mut rb), vec![ping_frame("typing")]);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_others_still_served() {
        let hub = ConnectionHub::new();
        let (slow, fast) = (user("slow@x.com"), user("fast@x.com"));
        let room = Room::Group(ObjectId::new());

        let (hs, mut rs) = SessionHandle::with_capacity(slow.clone(), 1);
        let (hf, mut rf) = SessionHandle::new(fast.clone());
        hub.register(hs).await;
        hub.register(hf).await;
        hub.join_room(room, &slow).await;
        hub.join_room(room, &fast).await;

        hub.send_to_user(&slow, &ping_frame("fills the buffer")).await;
        assert!(hub.is_connected(&slow).await);

        hub.send_to_room(room, &ping_frame("overflow"), None).await;
        assert!(!hub.is_connected(&slow).await);
        assert_eq!(*rs.close.borrow(), Some(CloseReason::SlowConsumer));
        assert_eq!(received(&mut rf), vec![ping_frame("overflow")]);

        hub.send_to_room(room, &ping_frame("after"), None).await;
        assert_eq!(received(&mut rf), vec![ping_frame("after")]);
        assert_eq!(received(&mut rs).len(), 1);
        assert_eq!(hub.room_members(room).await, vec![fast]);
    }

    #[tokio::test]
    async fn closed_receiver_counts_as_failure() {
        let hub = ConnectionHub::new();
        let a = user("a@x.com");
        let (handle, channels) = SessionHandle::new(a.clone());
        hub.register(handle).await;
        drop(channels);

        hub.send_to_user(&a, &ping_frame("lost")).await;
        assert!(!hub.is_connected(&a).await);
    }

    #[tokio::test]
    async fn broadcast_honours_predicate() {
        let hub = ConnectionHub::new();
        let (a, b) = (user("a@x.com"), user("b@x.com"));
        let (ha, mut ra) = SessionHandle::new(a.clone());
        let (hb, mut rb) = SessionHandle::new(b.clone());
        hub.register(ha).await;
        hub.register(hb).await;

        hub.broadcast(&ping_frame("all but a"), |u| u != &a).await;
        assert!(received(&mut ra).is_empty());
        assert_eq!(received(&mut rb).len(), 1);
    }

    #[tokio::test]
    async fn close_all_signals_every_session() {
        let hub = ConnectionHub::new();
        let (handle, channels) = SessionHandle::new(user("a@x.com"));
        hub.register(handle).await;

        hub.close_all(CloseReason::Shutdown).await;
        assert_eq!(*channels.close.borrow(), Some(CloseReason::Shutdown));
        assert_eq!(hub.connection_count().await, 0);
    }
}
