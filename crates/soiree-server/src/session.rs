//! One WebSocket connection.
//!
//! The first client frame must authenticate. After that a writer task
//! drains the hub's outbound queue and pings every 54 s, while the reader
//! dispatches control frames and drops the connection when no pong arrived
//! within 60 s.

use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use soiree_shared::constants::{MAX_INBOUND_FRAME_SIZE, PING_INTERVAL_SECS, PONG_WAIT_SECS, WRITE_WAIT_SECS};
use soiree_shared::protocol::{ClientFrame, ServerFrame};
use soiree_shared::{ObjectId, UserId};

use crate::api::AppState;
use crate::auth::AuthContext;
use crate::error::{msg, ChatError};
use crate::hub::{CloseReason, SessionHandle};
use crate::rooms::Room;
use crate::storage::Deadline;

const PING_INTERVAL: Duration = Duration::from_secs(PING_INTERVAL_SECS);
const PONG_WAIT: Duration = Duration::from_secs(PONG_WAIT_SECS);
const WRITE_WAIT: Duration = Duration::from_secs(WRITE_WAIT_SECS);

/// Close code sent when the handshake fails.
const POLICY_VIOLATION: u16 = 1008;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_INBOUND_FRAME_SIZE)
        .max_frame_size(MAX_INBOUND_FRAME_SIZE)
        .on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let ctx = match handshake(&mut stream, &state).await {
        Ok(ctx) => ctx,
        Err(err) => {
            debug!(error = %err, "handshake rejected");
            let frame = ServerFrame::Error {
                message: err.public_message().to_string(),
            };
            if let Ok(text) = frame.to_json() {
                let _ = send(&mut sink, Message::Text(text)).await;
            }
            let _ = send(&mut sink, close_message(POLICY_VIOLATION, "authentication failed")).await;
            return;
        }
    };
    let user = ctx.user_id.clone();

    let welcome = ServerFrame::Authenticated { user_id: user.clone() };
    match welcome.to_json() {
        Ok(text) if send(&mut sink, Message::Text(text.clone())).await => {}
        _ => return,
    }

    let (handle, channels) = SessionHandle::new(user.clone());
    let session_id = handle.id;
    let mut close_rx = channels.close.clone();
    state.hub.register(handle).await;
    state.presence.connected(&user).await;

    let mut writer = tokio::spawn(write_loop(sink, channels.outbound, channels.close));
    let mut writer_done = false;

    let mut pong_deadline = Instant::now() + PONG_WAIT;
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            next = tokio::time::timeout_at(pong_deadline, stream.next()) => match next {
                Err(_) => {
                    info!(user = %user, session = %session_id, "pong deadline missed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(user = %user, error = %e, "socket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => dispatch(&state, &ctx, &text).await,
                    Message::Pong(_) => pong_deadline = Instant::now() + PONG_WAIT,
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Ping(_) => {}
                },
            }
        }
    }

    // Dropping our handle ends the writer once it has flushed.
    state.hub.unregister(session_id, &user).await;
    state.presence.disconnected(&user).await;
    if !writer_done {
        let _ = writer.await;
    }
    info!(user = %user, session = %session_id, "session closed");
}

/// Wait for the `authenticate` frame and validate its token.
async fn handshake(stream: &mut WsStream, state: &AppState) -> Result<AuthContext, ChatError> {
    let first = tokio::time::timeout(PONG_WAIT, stream.next())
        .await
        .map_err(|_| ChatError::Auth(msg::AUTH_REQUIRED))?;

    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        _ => return Err(ChatError::Auth(msg::AUTH_REQUIRED)),
    };

    match ClientFrame::parse(&text) {
        Ok(ClientFrame::Authenticate { token }) => state.auth.verify(&token),
        _ => Err(ChatError::Auth(msg::AUTH_REQUIRED)),
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<std::sync::Arc<str>>,
    mut close: watch::Receiver<Option<CloseReason>>,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    let reason = loop {
        tokio::select! {
            biased;

            changed = close.changed() => {
                break match changed {
                    Ok(()) => (*close.borrow()).unwrap_or(CloseReason::Disconnected),
                    Err(_) => CloseReason::Disconnected,
                };
            }
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break CloseReason::Disconnected;
                };
                if !send(&mut sink, Message::Text(payload.to_string())).await {
                    return;
                }
            }
            _ = ping.tick() => {
                if !send(&mut sink, Message::Ping(Vec::new())).await {
                    return;
                }
            }
        }
    };

    // Flush what the hub queued before closing.
    while let Ok(payload) = outbound.try_recv() {
        if !send(&mut sink, Message::Text(payload.to_string())).await {
            return;
        }
    }
    let _ = send(&mut sink, close_message(reason.code(), reason.as_str())).await;
}

async fn send(sink: &mut WsSink, message: Message) -> bool {
    matches!(tokio::time::timeout(WRITE_WAIT, sink.send(message)).await, Ok(Ok(())))
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

async fn dispatch(state: &AppState, ctx: &AuthContext, text: &str) {
    let user = &ctx.user_id;
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(user = %user, error = %e, "dropping malformed frame");
            return;
        }
    };

    match frame {
        ClientFrame::Authenticate { .. } => {
            debug!(user = %user, "already authenticated");
        }
        ClientFrame::JoinConversation { conversation_id } => {
            join(state, user, Room::Conversation(conversation_id)).await;
        }
        ClientFrame::LeaveConversation { conversation_id } => {
            state.hub.leave_room(Room::Conversation(conversation_id), user).await;
        }
        ClientFrame::JoinGroup { group_id } => {
            join(state, user, Room::Group(group_id)).await;
        }
        ClientFrame::LeaveGroup { group_id } => {
            state.hub.leave_room(Room::Group(group_id), user).await;
        }
        ClientFrame::Typing {
            conversation_id,
            group_id,
            is_typing,
        } => match (conversation_id, group_id) {
            (Some(conversation_id), _) => conversation_typing(state, user, conversation_id, is_typing).await,
            (None, Some(group_id)) => group_typing(state, user, group_id, is_typing).await,
            (None, None) => debug!(user = %user, "typing frame without a target"),
        },
        ClientFrame::GroupTyping { group_id, is_typing } => {
            group_typing(state, user, group_id, is_typing).await;
        }
        ClientFrame::UserPresence { is_online } => {
            state.presence.heartbeat(user, is_online).await;
        }
        ClientFrame::Unknown { kind } => {
            debug!(user = %user, kind = %kind, "ignoring unknown frame type");
        }
    }
}

/// Join a room after checking the user belongs to its conversation or group.
async fn join(state: &AppState, user: &UserId, room: Room) {
    let allowed = state
        .storage
        .run(Deadline::Point, |db| match room {
            Room::Conversation(id) => Ok(db.get_conversation(id)?.has_participant(user)),
            Room::Group(id) => Ok(db.get_group_member(id, user)?.is_some()),
        })
        .await;

    match allowed {
        Ok(true) => {
            state.hub.join_room(room, user).await;
        }
        Ok(false) => {
            let message = match room {
                Room::Conversation(_) => msg::CONVERSATION_FORBIDDEN,
                Room::Group(_) => msg::NOT_MEMBER,
            };
            refuse(state, user, message).await;
        }
        Err(e) => {
            if e.kind() == crate::error::ErrorKind::Internal {
                warn!(user = %user, ?room, error = %e, "room join check failed");
            }
            refuse(state, user, e.public_message()).await;
        }
    }
}

async fn refuse(state: &AppState, user: &UserId, message: &str) {
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    state.hub.send_to_user(user, &frame).await;
}

async fn conversation_typing(state: &AppState, user: &UserId, conversation_id: ObjectId, is_typing: bool) {
    let frame = ServerFrame::UserTyping {
        conversation_id,
        user_id: user.clone(),
        is_typing,
    };
    relay_typing(state, user, Room::Conversation(conversation_id), &frame).await;
}

async fn group_typing(state: &AppState, user: &UserId, group_id: ObjectId, is_typing: bool) {
    let frame = ServerFrame::GroupUserTyping {
        group_id,
        user_id: user.clone(),
        is_typing,
    };
    relay_typing(state, user, Room::Group(group_id), &frame).await;
}

/// Typing signals only leave a room the sender has joined.
async fn relay_typing(state: &AppState, user: &UserId, room: Room, frame: &ServerFrame) {
    if !state.hub.in_room(room, user).await {
        debug!(user = %user, ?room, "dropping typing frame for a room not joined");
        return;
    }
    state.hub.send_to_room(room, frame, Some(user)).await;
}
