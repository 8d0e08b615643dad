pub mod handlers;
pub mod limiter;
pub mod otp;
pub mod password;

use std::str::FromStr;

use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Role;
use crate::AppState;

pub const SESSION_TTL_HOURS: i64 = 24;
pub const RESET_TTL_MINUTES: i64 = 15;
const RECOVERY_PURPOSE: &str = "recovery";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: usize,
    /// Set on single-purpose tokens (password recovery); absent on session tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// The caller, as established by [`authenticate`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
    pub email: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl TryFrom<Claims> for AuthUser {
    type Error = AppError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
        let role = Role::from_str(&claims.role)
            .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
        Ok(Self { id, role, email: claims.email })
    }
}

fn sign(claims: &Claims, jwt_secret: &str) -> Result<String, AppError> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(jwt_secret.as_bytes()))
        .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

pub fn create_token(user_id: Uuid, email: &str, role: Role, jwt_secret: &str) -> Result<String, AppError> {
    let expiration = (Utc::now() + Duration::hours(SESSION_TTL_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role: role.as_str().to_string(),
        exp: expiration,
        purpose: None,
    };
    sign(&claims, jwt_secret)
}

pub fn create_reset_token(user_id: Uuid, email: &str, jwt_secret: &str) -> Result<String, AppError> {
    let expiration = (Utc::now() + Duration::minutes(RESET_TTL_MINUTES)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role: Role::User.as_str().to_string(),
        exp: expiration,
        purpose: Some(RECOVERY_PURPOSE.to_string()),
    };
    sign(&claims, jwt_secret)
}

pub fn validate_token(token: &str, jwt_secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
    Ok(token_data.claims)
}

/// Validates a session token; single-purpose tokens are refused.
pub fn validate_session(token: &str, jwt_secret: &str) -> Result<AuthUser, AppError> {
    let claims = validate_token(token, jwt_secret)?;
    if claims.purpose.is_some() {
        return Err(AppError::Unauthorized("Invalid or expired token".to_string()));
    }
    AuthUser::try_from(claims)
}

/// Returns the profile id carried by a password-recovery token.
pub fn validate_reset_token(token: &str, jwt_secret: &str) -> Result<Uuid, AppError> {
    let claims = validate_token(token, jwt_secret)?;
    if claims.purpose.as_deref() != Some(RECOVERY_PURPOSE) {
        return Err(AppError::Unauthorized("Invalid or expired reset token".to_string()));
    }
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized("Invalid or expired reset token".to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(header) = headers.get("Authorization") else {
        return Ok(None);
    };
    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid Authorization header format".to_string()))?;
    Ok(Some(token.trim().to_string()))
}

/// Websocket clients cannot set headers, so they pass `access_token` in the query.
fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "access_token")
        .map(|(_, value)| value.to_string())
}

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = match bearer_token(request.headers())? {
        Some(token) => token,
        None => query_token(request.uri())
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?,
    };
    let user = validate_session(&token, &state.config.jwt_secret)?;
    log::debug!("Authenticated user: {} for {}", user.id, request.uri().path());
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Admits admins and e-mails on the configured allow-list. Must run after [`authenticate`].
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;
    if !(user.is_admin() || state.config.is_admin_email(&user.email)) {
        log::warn!("User {} denied admin access", user.id);
        return Err(AppError::forbidden("Admin access required"));
    }
    Ok(next.run(request).await)
}

/// Extracts the caller when a valid session token is present, without rejecting anonymous requests.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<AuthUser>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = bearer_token(&parts.headers)
            .ok()
            .flatten()
            .and_then(|token| validate_session(&token, &state.config.jwt_secret).ok());
        Ok(OptionalUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-0123456789";

    #[test]
    fn session_token_round_trip() {
        let id = Uuid::new_v4();
        let token = create_token(id, "agent@example.com", Role::Agent, SECRET).unwrap();
        let user = validate_session(&token, SECRET).unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.role, Role::Agent);
        assert_eq!(user.email, "agent@example.com");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_token(Uuid::new_v4(), "a@example.com", Role::User, SECRET).unwrap();
        assert!(validate_session(&token, "another-secret-value").is_err());
    }

    #[test]
    fn reset_tokens_cannot_open_sessions() {
        let id = Uuid::new_v4();
        let reset = create_reset_token(id, "a@example.com", SECRET).unwrap();
        assert!(validate_session(&reset, SECRET).is_err());
        assert_eq!(validate_reset_token(&reset, SECRET).unwrap(), id);

        let session = create_token(id, "a@example.com", Role::User, SECRET).unwrap();
        assert!(validate_reset_token(&session, SECRET).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap(), None);
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap().as_deref(), Some("abc.def"));
        headers.insert("Authorization", HeaderValue::from_static("Basic xyz"));
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn websocket_query_token() {
        let uri: Uri = "/realtime?table=messages&access_token=tok123".parse().unwrap();
        assert_eq!(query_token(&uri).as_deref(), Some("tok123"));
        let uri: Uri = "/realtime?table=messages".parse().unwrap();
        assert_eq!(query_token(&uri), None);
    }
}
