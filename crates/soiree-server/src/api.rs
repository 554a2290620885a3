use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderValue, Method},
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use soiree_shared::types::{InvitationAction, MessageKind};
use soiree_shared::views::{
    ConversationSummary, ConversationView, DirectInvitationView, DirectMessageView, GroupInvitationView, GroupMemberView,
    GroupMessageView, GroupSummary, UserProfile,
};
use soiree_shared::{ObjectId, UserId};

use crate::accounts::AccountService;
use crate::auth::{AuthUser, JwtVerifier};
use crate::config::ServerConfig;
use crate::direct_chat::DirectChatService;
use crate::error::{msg, ChatError};
use crate::fanout::NotificationFanout;
use crate::group_chat::{GroupChatService, InvitationResponse};
use crate::hub::{ConnectionHub, Realtime};
use crate::presence::{PresenceTracker, PresenceView};
use crate::push::PushSink;
use crate::receipts::ReadReceiptEngine;
use crate::session::ws_handler;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub storage: Storage,
    pub hub: Arc<ConnectionHub>,
    pub presence: Arc<PresenceTracker>,
    pub auth: Arc<JwtVerifier>,
    pub fanout: NotificationFanout,
    pub receipts: ReadReceiptEngine,
    pub direct: DirectChatService,
    pub groups: GroupChatService,
    pub accounts: AccountService,
}

impl AppState {
    /// Wire the hub, presence tracker and services over one database.
    pub fn new(config: ServerConfig, jwt_secret: &str, storage: Storage, push: Arc<dyn PushSink>) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let presence = PresenceTracker::new(hub.clone(), Some(storage.clone()), config.presence_idle());

        let realtime: Arc<dyn Realtime> = hub.clone();
        let view: Arc<dyn PresenceView> = presence.clone();
        let fanout = NotificationFanout::new(realtime, view.clone(), storage.clone(), push);

        let receipts = ReadReceiptEngine::new(storage.clone(), fanout.clone());
        let direct = DirectChatService::new(storage.clone(), fanout.clone(), view.clone());
        let groups = GroupChatService::new(storage.clone(), fanout.clone(), view, receipts.clone());
        let accounts = AccountService::new(storage.clone(), fanout.clone());

        Self {
            config: Arc::new(config),
            storage,
            hub,
            presence,
            auth: Arc::new(JwtVerifier::new(jwt_secret)),
            fanout,
            receipts,
            direct,
            groups,
            accounts,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let chat = Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:id/messages",
            get(list_direct_messages).post(send_direct_message),
        )
        .route("/conversations/:id/read", post(mark_conversation_read))
        .route("/messages/:id/read", post(mark_message_read))
        .route("/admins/search", get(search_admins))
        .route("/invitations", get(list_direct_invitations).post(send_direct_invitation))
        .route("/invitations/:id/respond", post(respond_direct_invitation));

    let groups = Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/invitations/pending", get(list_pending_group_invitations))
        .route("/invitations/:id/respond", post(respond_group_invitation))
        .route("/invitations/:id", axum::routing::delete(cancel_group_invitation))
        .route("/users/search", get(search_users))
        .route("/:id/invite", post(invite_to_group))
        .route("/:id/invitations", get(list_group_invitations))
        .route("/:id/members", get(list_group_members))
        .route("/:id/messages", get(list_group_messages).post(send_group_message))
        .route("/:id/read", post(mark_group_read))
        .route("/:id/unread", get(group_unread_count))
        .route("/:id/leave", post(leave_group));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .nest("/api/chat", chat)
        .nest("/api/chat-groups", groups)
        .route("/api/admin/users/:email/admin", put(set_admin_rights))
        .route("/api/fcm/tokens", post(register_push_token).delete(unregister_push_token))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

// ---------------------------------------------------------------------------
// Envelope and parameters
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    message: &'static str,
    data: T,
}

type ApiResult<T> = Result<Json<Envelope<T>>, ChatError>;

fn ok<T: Serialize>(message: &'static str, data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        message,
        data,
    }))
}

/// `Json` whose rejections use the error envelope.
struct ApiJson<T>(T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(error = %rejection.body_text(), "request body rejected");
                Err(ChatError::Validation(msg::INVALID_BODY))
            }
        }
    }
}

/// `Query` whose rejections use the error envelope.
struct ApiQuery<T>(T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(error = %rejection.body_text(), "query string rejected");
                Err(ChatError::Validation(msg::INVALID_QUERY))
            }
        }
    }
}

/// A single path segment, undecodable ones reported as invalid ids.
struct ApiPath(String);

#[async_trait]
impl<S> FromRequestParts<S> for ApiPath
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<String>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(error = %rejection.body_text(), "path rejected");
                Err(ChatError::Validation(msg::INVALID_ID))
            }
        }
    }
}

fn object_id(raw: &str) -> Result<ObjectId, ChatError> {
    raw.parse().map_err(|_| ChatError::Validation(msg::INVALID_ID))
}

fn user_id(raw: &str) -> Result<UserId, ChatError> {
    UserId::parse(raw).map_err(|_| ChatError::Validation(msg::INVALID_EMAIL))
}

fn action(raw: &str) -> Result<InvitationAction, ChatError> {
    raw.parse().map_err(|_| ChatError::Validation(msg::INVALID_ACTION))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    before: Option<String>,
}

impl PageQuery {
    fn before(&self) -> Result<Option<ObjectId>, ChatError> {
        self.before.as_deref().map(object_id).transpose()
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBody {
    content: String,
    #[serde(default)]
    message_type: Option<MessageKind>,
}

#[derive(Deserialize)]
struct ActionBody {
    action: String,
}

#[derive(Deserialize)]
struct DirectInvitationBody {
    to_user_id: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CreateGroupBody {
    name: String,
    #[serde(default)]
    member_ids: Vec<String>,
}

#[derive(Deserialize)]
struct GroupInviteBody {
    user_id: String,
    message: Option<String>,
}

#[derive(Deserialize)]
struct AdminRightsBody {
    admin: bool,
}

#[derive(Deserialize)]
struct PushTokenBody {
    token: String,
    device: Option<String>,
    user_agent: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Direct chat
// ---------------------------------------------------------------------------

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> ApiResult<Vec<ConversationSummary>> {
    let data = state.direct.list_conversations(&ctx.user_id).await?;
    ok("Conversations récupérées", data)
}

async fn list_direct_messages(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> ApiResult<Vec<DirectMessageView>> {
    let data = state
        .direct
        .list_messages(object_id(&id)?, &ctx.user_id, page.limit, page.before()?)
        .await?;
    ok("Messages récupérés", data)
}

async fn send_direct_message(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiJson(body): ApiJson<ContentBody>,
) -> ApiResult<DirectMessageView> {
    let data = state
        .direct
        .send_message(object_id(&id)?, &ctx.user_id, &body.content, body.message_type)
        .await?;
    ok("Message envoyé", data)
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<serde_json::Value> {
    let marked = state
        .direct
        .mark_conversation_read(object_id(&id)?, &ctx.user_id)
        .await?;
    ok("Conversation marquée comme lue", serde_json::json!({ "marked": marked }))
}

async fn mark_message_read(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<()> {
    state.direct.mark_message_read(object_id(&id)?, &ctx.user_id).await?;
    ok("Message marqué comme lu", ())
}

async fn search_admins(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> ApiResult<Vec<UserProfile>> {
    let data = state.direct.search_admins(&ctx.user_id, &query.q, query.limit).await?;
    ok("Administrateurs trouvés", data)
}

async fn send_direct_invitation(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiJson(body): ApiJson<DirectInvitationBody>,
) -> ApiResult<DirectInvitationView> {
    let to = user_id(&body.to_user_id)?;
    let data = state.direct.send_invitation(&ctx.user_id, &to, &body.message).await?;
    ok("Invitation envoyée", data)
}

async fn list_direct_invitations(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> ApiResult<Vec<DirectInvitationView>> {
    let data = state.direct.list_received_invitations(&ctx.user_id).await?;
    ok("Invitations récupérées", data)
}

async fn respond_direct_invitation(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiJson(body): ApiJson<ActionBody>,
) -> ApiResult<Option<ConversationView>> {
    let id = object_id(&id)?;
    let action = action(&body.action)?;
    let data = state.direct.respond_to_invitation(id, &ctx.user_id, action).await?;
    let message = match action {
        InvitationAction::Accept => "Invitation acceptée",
        InvitationAction::Reject => "Invitation refusée",
    };
    ok(message, data)
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

async fn create_group(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiJson(body): ApiJson<CreateGroupBody>,
) -> ApiResult<GroupSummary> {
    // Malformed emails are skipped like unknown users.
    let members: Vec<UserId> = body
        .member_ids
        .iter()
        .filter_map(|raw| match user_id(raw) {
            Ok(member) => Some(member),
            Err(_) => {
                debug!(member = %raw, "skipping malformed member email");
                None
            }
        })
        .collect();
    let data = state.groups.create_group(&ctx.user_id, &body.name, &members).await?;
    ok("Groupe créé", data)
}

async fn list_groups(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> ApiResult<Vec<GroupSummary>> {
    let data = state.groups.list_groups(&ctx.user_id).await?;
    ok("Groupes récupérés", data)
}

async fn list_pending_group_invitations(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> ApiResult<Vec<GroupInvitationView>> {
    let data = state.groups.list_pending_invitations(&ctx.user_id).await?;
    ok("Invitations récupérées", data)
}

async fn respond_group_invitation(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiJson(body): ApiJson<ActionBody>,
) -> ApiResult<InvitationResponse> {
    let id = object_id(&id)?;
    let action = action(&body.action)?;
    let data = state.groups.respond_to_invitation(id, &ctx.user_id, action).await?;
    let message = match action {
        InvitationAction::Accept => "Invitation acceptée",
        InvitationAction::Reject => "Invitation refusée",
    };
    ok(message, data)
}

async fn cancel_group_invitation(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<()> {
    state.groups.cancel_invitation(object_id(&id)?, &ctx.user_id).await?;
    ok("Invitation annulée", ())
}

async fn search_users(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> ApiResult<Vec<UserProfile>> {
    let data = state.groups.search_users(&ctx.user_id, &query.q, query.limit).await?;
    ok("Utilisateurs trouvés", data)
}

async fn invite_to_group(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiJson(body): ApiJson<GroupInviteBody>,
) -> ApiResult<GroupInvitationView> {
    let group_id = object_id(&id)?;
    let invitee = user_id(&body.user_id)?;
    let data = state
        .groups
        .invite(group_id, &ctx.user_id, &invitee, body.message)
        .await?;
    ok("Invitation envoyée", data)
}

async fn list_group_invitations(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<Vec<GroupInvitationView>> {
    let data = state
        .groups
        .list_group_pending_invitations(object_id(&id)?, &ctx.user_id)
        .await?;
    ok("Invitations récupérées", data)
}

async fn list_group_members(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<Vec<GroupMemberView>> {
    let data = state.groups.list_members(object_id(&id)?, &ctx.user_id).await?;
    ok("Membres récupérés", data)
}

async fn list_group_messages(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> ApiResult<Vec<GroupMessageView>> {
    let data = state
        .groups
        .list_messages(object_id(&id)?, &ctx.user_id, page.limit, page.before()?)
        .await?;
    ok("Messages récupérés", data)
}

async fn send_group_message(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
    ApiJson(body): ApiJson<ContentBody>,
) -> ApiResult<GroupMessageView> {
    let data = state
        .groups
        .send_message(object_id(&id)?, &ctx.user_id, &body.content)
        .await?;
    ok("Message envoyé", data)
}

async fn mark_group_read(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<serde_json::Value> {
    let read_at = state.groups.mark_as_read(object_id(&id)?, &ctx.user_id).await?;
    ok("Messages marqués comme lus", serde_json::json!({ "read_at": read_at }))
}

async fn group_unread_count(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<serde_json::Value> {
    let count = state.groups.unread_count(object_id(&id)?, &ctx.user_id).await?;
    ok("Compteur récupéré", serde_json::json!({ "unread_count": count }))
}

async fn leave_group(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(id): ApiPath,
) -> ApiResult<()> {
    state.groups.leave_group(object_id(&id)?, &ctx.user_id).await?;
    ok("Vous avez quitté le groupe", ())
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

async fn set_admin_rights(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiPath(email): ApiPath,
    ApiJson(body): ApiJson<AdminRightsBody>,
) -> ApiResult<serde_json::Value> {
    let target = user_id(&email)?;
    let changed = state
        .accounts
        .set_admin_rights(&ctx.user_id, &target, body.admin)
        .await?;
    ok(
        "Droits administrateur mis à jour",
        serde_json::json!({ "user_email": target, "admin": body.admin, "changed": changed }),
    )
}

async fn register_push_token(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiJson(body): ApiJson<PushTokenBody>,
) -> ApiResult<()> {
    state
        .accounts
        .register_token(&ctx.user_id, &body.token, body.device, body.user_agent)
        .await?;
    ok("Token enregistré", ())
}

async fn unregister_push_token(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ApiJson(body): ApiJson<PushTokenBody>,
) -> ApiResult<serde_json::Value> {
    let removed = state.accounts.unregister_token(&ctx.user_id, &body.token).await?;
    ok("Token supprimé", serde_json::json!({ "removed": removed }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
