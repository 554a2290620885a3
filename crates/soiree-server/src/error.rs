use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use soiree_store::StoreError;

/// User-facing messages. The frontend displays them verbatim.
pub mod msg {
    pub const UNAUTHENTICATED: &str = "Non authentifié";
    pub const INVALID_TOKEN: &str = "Token invalide";
    pub const AUTH_REQUIRED: &str = "Authentification requise";
    pub const ADMIN_ONLY: &str = "Accès refusé. Admin uniquement";

    pub const INVALID_ID: &str = "ID invalide";
    pub const INVALID_EMAIL: &str = "Adresse email invalide";
    pub const INVALID_ACTION: &str = "Action invalide";
    pub const INVALID_BODY: &str = "Corps de requête invalide";
    pub const INVALID_QUERY: &str = "Paramètres de requête invalides";
    pub const EMPTY_MESSAGE: &str = "Le message ne peut pas être vide";
    pub const GROUP_NAME_REQUIRED: &str = "Le nom du groupe est requis";
    pub const SEARCH_TOO_SHORT: &str = "La recherche doit contenir au moins 2 caractères";
    pub const SELF_INVITATION: &str = "Vous ne pouvez pas vous inviter vous-même";
    pub const TOKEN_REQUIRED: &str = "Token requis";

    pub const USER_NOT_FOUND: &str = "Utilisateur introuvable";
    pub const CONVERSATION_NOT_FOUND: &str = "Conversation non trouvée";
    pub const MESSAGE_NOT_FOUND: &str = "Message non trouvé";
    pub const INVITATION_NOT_FOUND: &str = "Invitation non trouvée";
    pub const GROUP_NOT_FOUND: &str = "Groupe non trouvé";
    pub const NOT_FOUND: &str = "Ressource introuvable";

    pub const INVITATION_PENDING: &str = "Une invitation est déjà en attente";
    pub const ALREADY_RESPONDED: &str = "Cette invitation a déjà reçu une réponse";
    pub const ALREADY_MEMBER: &str = "Cet utilisateur est déjà membre du groupe";
    pub const CONFLICT: &str = "Opération en conflit avec l'état actuel";

    pub const CONVERSATION_FORBIDDEN: &str = "Accès refusé à cette conversation";
    pub const NOT_MEMBER: &str = "Vous n'êtes pas membre de ce groupe";
    pub const NOT_GROUP_ADMIN: &str = "Seuls les administrateurs du groupe peuvent effectuer cette action";
    pub const NOT_INVITEE: &str = "Cette invitation ne vous est pas destinée";
    pub const TARGET_NOT_ADMIN: &str = "Cet utilisateur n'est pas administrateur";

    pub const SERVER_ERROR: &str = "Erreur serveur";
}

/// Error classes surfaced at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Internal,
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing, malformed or expired token.
    #[error("{0}")]
    Auth(&'static str),

    /// Authenticated, but not a platform admin.
    #[error("{0}")]
    AdminOnly(&'static str),

    #[error("{0}")]
    Validation(&'static str),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    /// Storage, deadline or push failure. The detail is logged, never sent.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Auth(_) | ChatError::AdminOnly(_) => ErrorKind::Auth,
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Conflict(_) => ErrorKind::Conflict,
            ChatError::Forbidden(_) => ErrorKind::Forbidden,
            ChatError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
            ChatError::AdminOnly(_) | ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message safe to show a client.
    pub fn public_message(&self) -> &str {
        match self {
            ChatError::Auth(m)
            | ChatError::AdminOnly(m)
            | ChatError::Validation(m)
            | ChatError::NotFound(m)
            | ChatError::Conflict(m)
            | ChatError::Forbidden(m) => m,
            ChatError::Internal(_) => msg::SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ChatError::NotFound(msg::NOT_FOUND),
            StoreError::Conflict(_) => ChatError::Conflict(msg::CONFLICT),
            other => ChatError::Internal(other.to_string()),
        }
    }
}

/// Map a store `Conflict` to a specific message, everything else as usual.
pub fn on_conflict(message: &'static str) -> impl Fn(StoreError) -> ChatError {
    move |err| match err {
        StoreError::Conflict(_) => ChatError::Conflict(message),
        other => other.into(),
    }
}

/// Map a store `NotFound` to a specific message, everything else as usual.
pub fn on_missing(message: &'static str) -> impl Fn(StoreError) -> ChatError {
    move |err| match err {
        StoreError::NotFound => ChatError::NotFound(message),
        other => other.into(),
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ChatError::Internal(detail) = &self {
            tracing::error!(error = %detail, "request failed");
        }

        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_statuses() {
        assert_eq!(ChatError::AdminOnly(msg::ADMIN_ONLY).kind(), ErrorKind::Auth);
        assert_eq!(ChatError::AdminOnly(msg::ADMIN_ONLY).status(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::Auth(msg::INVALID_TOKEN).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChatError::Conflict(msg::CONFLICT).status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_detail_is_hidden() {
        let err = ChatError::Internal("disk on fire".into());
        assert_eq!(err.public_message(), msg::SERVER_ERROR);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn store_errors_map_to_kinds() {
        assert_eq!(ChatError::from(StoreError::NotFound).kind(), ErrorKind::NotFound);
        assert_eq!(
            ChatError::from(StoreError::Conflict("dup".into())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ChatError::from(StoreError::Corrupt("bad".into())).kind(),
            ErrorKind::Internal
        );

        let mapped = on_conflict(msg::INVITATION_PENDING)(StoreError::Conflict("dup".into()));
        assert_eq!(mapped.public_message(), msg::INVITATION_PENDING);
        let mapped = on_missing(msg::GROUP_NOT_FOUND)(StoreError::NotFound);
        assert_eq!(mapped.public_message(), msg::GROUP_NOT_FOUND);
    }

    #[tokio::test]
    async fn response_body_shape() {
        let response = ChatError::NotFound(msg::GROUP_NOT_FOUND).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "Not Found");
        assert_eq!(json["message"], msg::GROUP_NOT_FOUND);
    }
}
