//! Direct messages between users.
//!
//! A message may carry a `client_ref` chosen by the sending device. The pair
//! `(sender_id, client_ref)` is unique, so a device retrying a send it is
//! unsure about gets the stored row back instead of a duplicate.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::models::{Message, NewMessage};
use crate::realtime::ChangeEvent;
use crate::schema::messages;
use crate::AppState;

pub const MAX_CONTENT_CHARS: usize = 5_000;

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub receiver_id: Uuid,
    pub content: String,
    pub property_id: Option<Uuid>,
    pub client_ref: Option<Uuid>,
}

pub fn clean_content(raw: &str) -> Result<String, AppError> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(AppError::validation("Message cannot be empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::validation(format!("Messages are limited to {} characters", MAX_CONTENT_CHARS)));
    }
    Ok(content.to_string())
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    if body.receiver_id == user.id {
        return Err(AppError::validation("You cannot message yourself"));
    }
    let content = clean_content(&body.content)?;
    let hub = state.hub.clone();

    let (message, created) = db::run(&state.pool, move |conn| {
        let inserted: Option<Message> = diesel::insert_into(messages::table)
            .values(NewMessage {
                sender_id: user.id,
                receiver_id: body.receiver_id,
                property_id: body.property_id,
                content,
                client_ref: body.client_ref,
            })
            .on_conflict((messages::sender_id, messages::client_ref))
            .do_nothing()
            .returning(Message::as_returning())
            .get_result(conn)
            .optional()?;

        match (inserted, body.client_ref) {
            (Some(message), _) => {
                hub.publish("messages", ChangeEvent::Insert, &message);
                Ok((message, true))
            }
            (None, Some(client_ref)) => {
                let existing = messages::table
                    .filter(messages::sender_id.eq(user.id))
                    .filter(messages::client_ref.eq(client_ref))
                    .select(Message::as_select())
                    .first(conn)?;
                Ok((existing, false))
            }
            (None, None) => Err(AppError::Internal("Message insert returned no row".to_string())),
        }
    })
    .await?;

    if !created {
        log::debug!("Duplicate send of message {} ignored", message.id);
    }
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

impl MessageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, 500)
    }
}

pub async fn inbox(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        let mut q = messages::table.filter(messages::receiver_id.eq(user.id)).into_boxed();
        if query.unread_only {
            q = q.filter(messages::is_read.eq(false));
        }
        if let Some(since) = query.since {
            q = q.filter(messages::created_at.gt(since));
        }
        Ok(q.order(messages::created_at.desc())
            .limit(query.limit())
            .select(Message::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

/// Both directions of the conversation with `other_id`, oldest first.
pub async fn conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(other_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        let mut q = messages::table
            .filter(
                messages::sender_id
                    .eq(user.id)
                    .and(messages::receiver_id.eq(other_id))
                    .or(messages::sender_id.eq(other_id).and(messages::receiver_id.eq(user.id))),
            )
            .into_boxed();
        if let Some(since) = query.since {
            q = q.filter(messages::created_at.gt(since));
        }
        // Newest page, returned in ascending order.
        let mut page: Vec<Message> = q
            .order(messages::created_at.desc())
            .limit(query.limit())
            .select(Message::as_select())
            .load(conn)?;
        page.reverse();
        Ok(page)
    })
    .await?;
    Ok(Json(items))
}

/// Messages sent by the caller at or after `since`; used by clients to reconcile their outbox.
pub async fn sent_since(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>, AppError> {
    let since = query
        .since
        .ok_or_else(|| AppError::validation("The since parameter is required"))?;
    let items = db::run(&state.pool, move |conn| {
        Ok(messages::table
            .filter(messages::sender_id.eq(user.id))
            .filter(messages::created_at.ge(since))
            .order(messages::created_at.asc())
            .limit(query.limit())
            .select(Message::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Message>, AppError> {
    let hub = state.hub.clone();
    let message = db::run(&state.pool, move |conn| {
        let message: Message = diesel::update(
            messages::table
                .find(message_id)
                .filter(messages::receiver_id.eq(user.id)),
        )
        .set(messages::is_read.eq(true))
        .returning(Message::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or(AppError::NotFound("Message"))?;
        hub.publish("messages", ChangeEvent::Update, &message);
        Ok(message)
    })
    .await?;
    Ok(Json(message))
}

pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(other_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let hub = state.hub.clone();
    let updated = db::run(&state.pool, move |conn| {
        let rows: Vec<Message> = diesel::update(
            messages::table
                .filter(messages::sender_id.eq(other_id))
                .filter(messages::receiver_id.eq(user.id))
                .filter(messages::is_read.eq(false)),
        )
        .set(messages::is_read.eq(true))
        .returning(Message::as_returning())
        .get_results(conn)?;
        for row in &rows {
            hub.publish("messages", ChangeEvent::Update, row);
        }
        Ok(rows.len())
    })
    .await?;
    Ok(Json(json!({ "updated": updated })))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    let count: i64 = db::run(&state.pool, move |conn| {
        Ok(messages::table
            .filter(messages::receiver_id.eq(user.id))
            .filter(messages::is_read.eq(false))
            .count()
            .get_result(conn)?)
    })
    .await?;
    Ok(Json(json!({ "count": count })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed_and_bounded() {
        assert_eq!(clean_content("  hello  ").unwrap(), "hello");
        assert!(clean_content(" \n ").is_err());
        assert!(clean_content(&"a".repeat(MAX_CONTENT_CHARS)).is_ok());
        assert!(clean_content(&"a".repeat(MAX_CONTENT_CHARS + 1)).is_err());
    }

    #[test]
    fn query_limit_is_clamped() {
        let query = MessageQuery { since: None, unread_only: false, limit: Some(10_000) };
        assert_eq!(query.limit(), 500);
        let query = MessageQuery { since: None, unread_only: false, limit: None };
        assert_eq!(query.limit(), 100);
    }
}
