use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::models::{NewNotification, Notification};
use crate::realtime::{ChangeEvent, StagedChanges};
use crate::schema::notifications;
use crate::AppState;

/// Stores a notification for `profile_id` and stages it for realtime
/// subscribers; the caller publishes `staged` once its transaction commits.
pub fn notify(
    conn: &mut PgConnection,
    staged: &mut StagedChanges,
    profile_id: Uuid,
    kind: &str,
    title: &str,
    body: &str,
) -> Result<Notification, AppError> {
    let notification: Notification = diesel::insert_into(notifications::table)
        .values(NewNotification {
            profile_id,
            kind: kind.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        })
        .returning(Notification::as_returning())
        .get_result(conn)?;
    staged.stage("notifications", ChangeEvent::Insert, &notification);
    Ok(notification)
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let items = db::run(&state.pool, move |conn| {
        let mut q = notifications::table
            .filter(notifications::profile_id.eq(user.id))
            .into_boxed();
        if query.unread_only {
            q = q.filter(notifications::is_read.eq(false));
        }
        Ok(q.order(notifications::created_at.desc())
            .limit(limit)
            .select(Notification::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let hub = state.hub.clone();
    let notification = db::run(&state.pool, move |conn| {
        let updated: Notification = diesel::update(
            notifications::table
                .filter(notifications::id.eq(notification_id))
                .filter(notifications::profile_id.eq(user.id)),
        )
        .set(notifications::is_read.eq(true))
        .returning(Notification::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or(AppError::NotFound("Notification"))?;
        hub.publish("notifications", ChangeEvent::Update, &updated);
        Ok(updated)
    })
    .await?;
    Ok(Json(notification))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    let updated = db::run(&state.pool, move |conn| {
        Ok(diesel::update(
            notifications::table
                .filter(notifications::profile_id.eq(user.id))
                .filter(notifications::is_read.eq(false)),
        )
        .set(notifications::is_read.eq(true))
        .execute(conn)?)
    })
    .await?;
    Ok(Json(json!({ "updated": updated })))
}
