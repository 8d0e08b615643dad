use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{create_reset_token, create_token, otp, password, validate_reset_token, AuthUser, SESSION_TTL_HOURS};
use crate::db;
use crate::error::AppError;
use crate::models::{CodePurpose, NewProfile, NewWallet, Profile, ProfileChanges, ProfileView, PublicProfile, Role};
use crate::schema::{profiles, wallets};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
    pub purpose: CodePurpose,
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
    pub purpose: CodePurpose,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub reset_token: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: ProfileView,
}

pub fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    };
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(AppError::validation("Please enter a valid email address"));
    }
    Ok(email)
}

/// Only self-service roles may be chosen at sign-up.
fn signup_role(raw: Option<&str>) -> Result<Role, AppError> {
    match raw {
        None => Ok(Role::User),
        Some(raw) => match Role::from_str(raw)? {
            Role::Admin => Err(AppError::forbidden("Admin accounts cannot be self-registered")),
            role => Ok(role),
        },
    }
}

fn session(state: &AppState, profile: Profile) -> Result<SessionResponse, AppError> {
    let role = Role::from_str(&profile.role)?;
    let access_token = create_token(profile.id, &profile.email, role, &state.config.jwt_secret)?;
    Ok(SessionResponse {
        access_token,
        token_type: "bearer",
        expires_in: SESSION_TTL_HOURS * 3600,
        user: profile.into(),
    })
}

fn find_by_email(conn: &mut PgConnection, email: &str) -> Result<Option<Profile>, AppError> {
    Ok(profiles::table
        .filter(profiles::email.eq(email))
        .select(Profile::as_select())
        .first(conn)
        .optional()?)
}

pub async fn sign_up(
    State(state): State<AppState>,
    Json(req): Json<SignUpRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let email = normalize_email(&req.email)?;
    password::validate_strength(&req.password)?;
    let full_name = req.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(AppError::validation("Full name is required"));
    }
    let role = signup_role(req.role.as_deref())?;
    let currency = state.config.momo_currency.clone();
    let new_profile = NewProfile {
        email: email.clone(),
        password_hash: password::hash_password(&req.password)?,
        full_name,
        phone: req.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
        role: role.as_str().to_string(),
    };

    let (profile, code) = db::run(&state.pool, move |conn| {
        let profile = conn
            .transaction::<_, AppError, _>(|conn| {
                let profile: Profile = diesel::insert_into(profiles::table)
                    .values(&new_profile)
                    .returning(Profile::as_returning())
                    .get_result(conn)?;
                diesel::insert_into(wallets::table)
                    .values(NewWallet { profile_id: profile.id, currency })
                    .execute(conn)?;
                Ok(profile)
            })
            .map_err(|e| match e {
                AppError::Conflict(_) => AppError::Conflict("An account with this email already exists".to_string()),
                other => other,
            })?;
        let code = otp::issue(conn, profile.id, CodePurpose::Signup)?;
        Ok((profile, code))
    })
    .await?;

    otp::deliver(&profile.email, CodePurpose::Signup, &code);
    log::info!("Registered {} as {}", profile.id, profile.role);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "user": ProfileView::from(profile), "confirmation_required": true })),
    ))
}

pub async fn sign_in(
    State(state): State<AppState>,
    Json(req): Json<SignInRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let email = normalize_email(&req.email).map_err(|_| AppError::InvalidCredentials)?;
    state.signin_limiter.check(&email).await?;

    let lookup = email.clone();
    let profile = db::run(&state.pool, move |conn| find_by_email(conn, &lookup)).await?;
    let profile = match profile {
        Some(p) if password::verify_password(&req.password, &p.password_hash) => p,
        _ => {
            state.signin_limiter.record_failure(&email).await;
            return Err(AppError::InvalidCredentials);
        }
    };
    if !profile.email_confirmed {
        return Err(AppError::EmailNotConfirmed);
    }

    state.signin_limiter.reset(&email).await;
    log::info!("User {} signed in", profile.id);
    Ok(Json(session(&state, profile)?))
}

pub async fn verify_code(State(state): State<AppState>, Json(req): Json<VerifyRequest>) -> Result<Json<Value>, AppError> {
    let email = normalize_email(&req.email)?;
    state.otp_limiter.check(&email).await?;

    let purpose = req.purpose;
    let code = req.code;
    let result = db::run(&state.pool, move |conn| {
        let profile = find_by_email(conn, &email)?.ok_or_else(|| AppError::validation("Invalid or expired code"))?;
        otp::verify(conn, profile.id, purpose, &code)?;
        if purpose == CodePurpose::Signup && !profile.email_confirmed {
            let confirmed = diesel::update(profiles::table.find(profile.id))
                .set((profiles::email_confirmed.eq(true), profiles::updated_at.eq(Utc::now())))
                .returning(Profile::as_returning())
                .get_result(conn)?;
            return Ok(confirmed);
        }
        Ok(profile)
    })
    .await;

    let profile = match result {
        Ok(profile) => profile,
        Err(e) => {
            if matches!(e, AppError::Validation(_)) {
                state.otp_limiter.record_failure(&req.email).await;
            }
            return Err(e);
        }
    };

    match purpose {
        CodePurpose::Signup => {
            log::info!("User {} confirmed their email", profile.id);
            Ok(Json(serde_json::to_value(session(&state, profile)?).map_err(|e| AppError::Internal(e.to_string()))?))
        }
        CodePurpose::Recovery => {
            let reset_token = create_reset_token(profile.id, &profile.email, &state.config.jwt_secret)?;
            Ok(Json(json!({ "reset_token": reset_token })))
        }
    }
}

async fn send_code(state: &AppState, raw_email: &str, purpose: CodePurpose) -> Result<(), AppError> {
    let email = normalize_email(raw_email)?;
    let limiter_key = format!("send:{}", email);
    state.otp_limiter.check(&limiter_key).await?;
    state.otp_limiter.record_failure(&limiter_key).await;

    let issued = db::run(&state.pool, move |conn| {
        let Some(profile) = find_by_email(conn, &email)? else {
            return Ok(None);
        };
        if purpose == CodePurpose::Signup && profile.email_confirmed {
            return Ok(None);
        }
        let code = otp::issue(conn, profile.id, purpose)?;
        Ok(Some((profile.email, code)))
    })
    .await?;

    // Unknown addresses get the same response so accounts cannot be enumerated.
    if let Some((email, code)) = issued {
        otp::deliver(&email, purpose, &code);
    }
    Ok(())
}

pub async fn resend_code(State(state): State<AppState>, Json(req): Json<ResendRequest>) -> Result<Json<Value>, AppError> {
    send_code(&state, &req.email, req.purpose).await?;
    Ok(Json(json!({ "sent": true })))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<Value>, AppError> {
    send_code(&state, &req.email, CodePurpose::Recovery).await?;
    Ok(Json(json!({ "sent": true })))
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<Value>, AppError> {
    let profile_id = validate_reset_token(&req.reset_token, &state.config.jwt_secret)?;
    password::validate_strength(&req.new_password)?;
    let hash = password::hash_password(&req.new_password)?;

    let email = db::run(&state.pool, move |conn| {
        let email = diesel::update(profiles::table.find(profile_id))
            .set((profiles::password_hash.eq(hash), profiles::updated_at.eq(Utc::now())))
            .returning(profiles::email)
            .get_result::<String>(conn)?;
        Ok(email)
    })
    .await?;

    state.signin_limiter.reset(&email).await;
    log::info!("Password reset for {}", profile_id);
    Ok(Json(json!({ "updated": true })))
}

pub async fn get_me(State(state): State<AppState>, Extension(user): Extension<AuthUser>) -> Result<Json<ProfileView>, AppError> {
    let profile = db::run(&state.pool, move |conn| {
        Ok(profiles::table.find(user.id).select(Profile::as_select()).first(conn)?)
    })
    .await?;
    Ok(Json(profile.into()))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(mut changes): Json<ProfileChanges>,
) -> Result<Json<ProfileView>, AppError> {
    if changes.is_empty() {
        return Err(AppError::validation("Nothing to update"));
    }
    if let Some(name) = changes.full_name.as_mut() {
        *name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::validation("Full name is required"));
        }
    }

    let profile = db::run(&state.pool, move |conn| {
        Ok(diesel::update(profiles::table.find(user.id))
            .set((&changes, profiles::updated_at.eq(Utc::now())))
            .returning(Profile::as_returning())
            .get_result(conn)?)
    })
    .await?;
    Ok(Json(profile.into()))
}

pub async fn get_public_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<Uuid>,
) -> Result<Json<PublicProfile>, AppError> {
    let profile = db::run(&state.pool, move |conn| {
        profiles::table
            .find(profile_id)
            .select(Profile::as_select())
            .first(conn)
            .optional()?
            .ok_or(AppError::NotFound("Profile"))
    })
    .await?;
    Ok(Json(profile.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalised() {
        assert_eq!(normalize_email("  Jane.Doe@Example.COM ").unwrap(), "jane.doe@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("jane@localhost").is_err());
        assert!(normalize_email("ja ne@example.com").is_err());
    }

    #[test]
    fn admin_cannot_be_chosen_at_signup() {
        assert_eq!(signup_role(None).unwrap(), Role::User);
        assert_eq!(signup_role(Some("agent")).unwrap(), Role::Agent);
        assert!(matches!(signup_role(Some("admin")), Err(AppError::Forbidden(_))));
        assert!(signup_role(Some("wizard")).is_err());
    }
}
