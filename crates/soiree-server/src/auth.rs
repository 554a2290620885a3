//! Bearer token validation.
//!
//! Tokens are minted by the account service of the platform (HS256). The
//! chat core only validates them and extracts the caller's email.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use soiree_shared::UserId;
use soiree_store::{Database, User};

use crate::api::AppState;
use crate::error::{msg, ChatError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// The authenticated caller. The token's `is_admin` claim is not carried:
/// admin checks read the stored flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthContext, ChatError> {
        let data = decode::<Claims>(token.trim(), &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            ChatError::Auth(msg::INVALID_TOKEN)
        })?;
        let claims = data.claims;

        // Chat keys users by email; older tokens only carry it in `user_id`.
        let user_id = claims
            .email
            .as_deref()
            .and_then(|email| UserId::parse(email).ok())
            .or_else(|| UserId::parse(&claims.user_id).ok())
            .ok_or(ChatError::Auth(msg::INVALID_TOKEN))?;

        Ok(AuthContext { user_id })
    }
}

/// Load `user` and require the platform admin flag. The stored flag wins
/// over the token claim, which may predate a rights change.
pub(crate) fn require_platform_admin(db: &Database, user: &UserId) -> Result<User, ChatError> {
    match db.find_user(user)? {
        Some(found) if found.is_admin => Ok(found),
        _ => Err(ChatError::AdminOnly(msg::ADMIN_ONLY)),
    }
}

/// Extractor for routes that require `Authorization: Bearer <jwt>`.
pub struct AuthUser(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ChatError::Auth(msg::UNAUTHENTICATED))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ChatError::Auth(msg::UNAUTHENTICATED))?;

        state.auth.verify(token).map(AuthUser)
    }
}

#[cfg(test)]
pub(crate) fn sign_token(secret: &str, email: &str, is_admin: bool) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        user_id: "65f0c0ffee0000000000abcd".into(),
        email: Some(email.into()),
        is_admin,
        exp: now + 3600,
        iat: now,
        nbf: None,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
