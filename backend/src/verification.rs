//! Agent licence verification.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::models::{AgentVerification, NewAgentVerification, Role, VerificationStatus};
use crate::notification::notify;
use crate::realtime::StagedChanges;
use crate::schema::{agent_verifications, profiles};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct VerificationBody {
    pub license_number: String,
    pub document_url: String,
}

impl VerificationBody {
    fn into_new(self, profile_id: Uuid) -> Result<NewAgentVerification, AppError> {
        let license_number = self.license_number.trim().to_uppercase();
        if license_number.len() < 4 || !license_number.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/') {
            return Err(AppError::validation("Please enter a valid licence number"));
        }
        let document_url = self.document_url.trim().to_string();
        if !document_url.starts_with("/storage/documents/") && !document_url.starts_with("https://") {
            return Err(AppError::validation("Upload the licence document before submitting"));
        }
        Ok(NewAgentVerification { profile_id, license_number, document_url })
    }
}

pub async fn submit_verification(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<VerificationBody>,
) -> Result<(StatusCode, Json<AgentVerification>), AppError> {
    if user.role != Role::Agent {
        return Err(AppError::forbidden("Only agents can request verification"));
    }
    let new_verification = body.into_new(user.id)?;
    let verification = db::run(&state.pool, move |conn| {
        diesel::insert_into(agent_verifications::table)
            .values(&new_verification)
            .returning(AgentVerification::as_returning())
            .get_result(conn)
            .map_err(|e| match AppError::from(e) {
                AppError::Conflict(_) => AppError::Conflict("A verification request is already pending".to_string()),
                other => other,
            })
    })
    .await?;
    log::info!("Verification {} submitted by {}", verification.id, user.id);
    Ok((StatusCode::CREATED, Json(verification)))
}

pub async fn my_verifications(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<AgentVerification>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(agent_verifications::table
            .filter(agent_verifications::profile_id.eq(user.id))
            .order(agent_verifications::created_at.desc())
            .select(AgentVerification::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub status: VerificationStatus,
    pub notes: Option<String>,
}

pub async fn review_verification(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(verification_id): Path<Uuid>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<AgentVerification>, AppError> {
    if body.status == VerificationStatus::Pending {
        return Err(AppError::validation("A review must approve or reject"));
    }
    let hub = state.hub.clone();
    let verification = db::run(&state.pool, move |conn| {
        let mut staged = StagedChanges::new();
        let verification = conn.transaction(|conn| {
            let verification: AgentVerification = diesel::update(
                agent_verifications::table
                    .find(verification_id)
                    .filter(agent_verifications::status.eq(VerificationStatus::Pending.as_str())),
            )
            .set((
                agent_verifications::status.eq(body.status.as_str()),
                agent_verifications::reviewer_id.eq(Some(admin.id)),
                agent_verifications::notes.eq(body.notes),
                agent_verifications::updated_at.eq(Utc::now()),
            ))
            .returning(AgentVerification::as_returning())
            .get_result(conn)
            .optional()?
            .ok_or(AppError::NotFound("Pending verification"))?;

            let approved = body.status == VerificationStatus::Approved;
            diesel::update(profiles::table.find(verification.profile_id))
                .set((profiles::is_verified.eq(approved), profiles::updated_at.eq(Utc::now())))
                .execute(conn)?;
            let (title, text) = if approved {
                ("Verification approved", "Your agent licence was verified.")
            } else {
                ("Verification rejected", "Your agent licence could not be verified. Check the notes and resubmit.")
            };
            notify(conn, &mut staged, verification.profile_id, "verification", title, text)?;
            Ok::<_, AppError>(verification)
        })?;
        staged.publish(&hub);
        Ok(verification)
    })
    .await?;
    log::info!("Verification {} marked {} by {}", verification_id, verification.status, admin.id);
    Ok(Json(verification))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(license: &str, url: &str) -> VerificationBody {
        VerificationBody { license_number: license.to_string(), document_url: url.to_string() }
    }

    #[test]
    fn licence_submissions_are_checked() {
        let id = Uuid::new_v4();
        let ok = body(" reb-2024/117 ", "/storage/documents/abc.pdf").into_new(id).unwrap();
        assert_eq!(ok.license_number, "REB-2024/117");
        assert!(body("ab", "/storage/documents/abc.pdf").into_new(id).is_err());
        assert!(body("REB 2024", "/storage/documents/abc.pdf").into_new(id).is_err());
        assert!(body("REB-2024", "ftp://example.com/x.pdf").into_new(id).is_err());
    }
}
