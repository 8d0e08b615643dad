//! Row-change broadcasting and the `/realtime` websocket.
//!
//! Every write that other sessions care about publishes a [`RowChange`]. A
//! websocket subscribes to one table, optionally narrowed with a
//! `column=eq.value` filter, and receives matching changes as JSON text frames.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Extension;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::Role;
use crate::AppState;

const HUB_CAPACITY: usize = 1024;

/// Tables a subscriber may only watch through a filter on one of their own columns.
const PRIVATE_TABLES: &[(&str, &[&str])] = &[
    ("messages", &["receiver_id", "sender_id"]),
    ("notifications", &["profile_id"]),
    ("wallets", &["profile_id"]),
    ("withdrawal_requests", &["profile_id"]),
    ("transactions", &["profile_id"]),
    ("reservations", &["tenant_id", "owner_id"]),
    ("commission_payments", &["agent_id"]),
];

const PUBLIC_TABLES: &[&str] = &["properties", "property_reviews"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowChange {
    pub table: &'static str,
    pub event: ChangeEvent,
    pub record: Value,
    pub commit_timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<Arc<RowChange>>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(HUB_CAPACITY)
    }
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish<T: Serialize>(&self, table: &'static str, event: ChangeEvent, row: &T) {
        if let Some(record) = to_record(table, row) {
            self.send(table, event, record);
        }
    }

    fn send(&self, table: &'static str, event: ChangeEvent, record: Value) {
        let change = RowChange { table, event, record, commit_timestamp: Utc::now() };
        // No subscribers is not an error.
        let _ = self.sender.send(Arc::new(change));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RowChange>> {
        self.sender.subscribe()
    }
}

fn to_record<T: Serialize>(table: &str, row: &T) -> Option<Value> {
    match serde_json::to_value(row) {
        Ok(record) => Some(record),
        Err(e) => {
            log::error!("Failed to serialise {} change: {}", table, e);
            None
        }
    }
}

/// Changes made inside a database transaction. They are held back until the
/// transaction commits and dropped unpublished if it rolls back.
#[derive(Debug, Default)]
pub struct StagedChanges {
    changes: Vec<(&'static str, ChangeEvent, Value)>,
}

impl StagedChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage<T: Serialize>(&mut self, table: &'static str, event: ChangeEvent, row: &T) {
        if let Some(record) = to_record(table, row) {
            self.changes.push((table, event, record));
        }
    }

    /// Publishes everything staged, in staging order.
    pub fn publish(self, hub: &RealtimeHub) {
        for (table, event, record) in self.changes {
            hub.send(table, event, record);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub table: String,
    pub filter: Option<ColumnFilter>,
}

impl Subscription {
    /// Parses a table name and an optional `column=eq.value` filter.
    pub fn parse(table: &str, filter: Option<&str>) -> Result<Self, AppError> {
        let known = PUBLIC_TABLES.contains(&table) || PRIVATE_TABLES.iter().any(|(name, _)| *name == table);
        if !known {
            return Err(AppError::validation(format!("Table '{}' cannot be subscribed to", table)));
        }

        let filter = match filter.map(str::trim).filter(|f| !f.is_empty()) {
            None => None,
            Some(raw) => {
                let (column, rest) = raw
                    .split_once('=')
                    .ok_or_else(|| AppError::validation("Filter must look like column=eq.value"))?;
                let value = rest
                    .strip_prefix("eq.")
                    .ok_or_else(|| AppError::validation("Only eq filters are supported"))?;
                if column.is_empty() || value.is_empty() {
                    return Err(AppError::validation("Filter must look like column=eq.value"));
                }
                Some(ColumnFilter { column: column.to_string(), value: value.to_string() })
            }
        };

        Ok(Self { table: table.to_string(), filter })
    }

    /// Private tables are only visible through a filter on the caller's own id.
    pub fn authorize(&self, user: &AuthUser) -> Result<(), AppError> {
        if user.role == Role::Admin {
            return Ok(());
        }
        let Some((_, owner_columns)) = PRIVATE_TABLES.iter().find(|(name, _)| *name == self.table) else {
            return Ok(());
        };
        match &self.filter {
            Some(f) if owner_columns.contains(&f.column.as_str()) && f.value == user.id.to_string() => Ok(()),
            _ => Err(AppError::forbidden(format!(
                "Subscriptions to {} must filter on your own {}",
                self.table,
                owner_columns.join(" or ")
            ))),
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => match change.record.get(&filter.column) {
                Some(Value::String(s)) => *s == filter.value,
                Some(Value::Null) | None => false,
                Some(other) => other.to_string() == filter.value,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    pub table: String,
    pub filter: Option<String>,
}

pub async fn realtime_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<RealtimeParams>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = Subscription::parse(&params.table, params.filter.as_deref())?;
    subscription.authorize(&user)?;
    let receiver = state.hub.subscribe();
    log::info!("User {} subscribed to {}", user.id, subscription.table);
    Ok(ws.on_upgrade(move |socket| stream_changes(socket, subscription, receiver)))
}

async fn stream_changes(
    socket: WebSocket,
    subscription: Subscription,
    mut receiver: broadcast::Receiver<Arc<RowChange>>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            },
            change = receiver.recv() => match change {
                Ok(change) => {
                    if !subscription.matches(&change) {
                        continue;
                    }
                    let text = match serde_json::to_string(change.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Failed to encode row change: {}", e);
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        log::debug!("Realtime client disconnected");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Realtime subscriber on {} lagged, {} changes dropped", subscription.table, skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn user(role: Role) -> AuthUser {
        AuthUser { id: Uuid::new_v4(), role, email: "u@example.com".to_string() }
    }

    fn change(table: &'static str, record: Value) -> RowChange {
        RowChange { table, event: ChangeEvent::Insert, record, commit_timestamp: Utc::now() }
    }

    #[test]
    fn parses_eq_filters() {
        let sub = Subscription::parse("messages", Some("receiver_id=eq.abc")).unwrap();
        assert_eq!(
            sub.filter,
            Some(ColumnFilter { column: "receiver_id".to_string(), value: "abc".to_string() })
        );
        assert!(Subscription::parse("messages", Some("receiver_id=gt.abc")).is_err());
        assert!(Subscription::parse("profiles", None).is_err());
    }

    #[test]
    fn private_tables_require_own_filter() {
        let me = user(Role::User);
        let own = Subscription::parse("messages", Some(&format!("receiver_id=eq.{}", me.id))).unwrap();
        assert!(own.authorize(&me).is_ok());

        let someone_else = Subscription::parse("messages", Some(&format!("receiver_id=eq.{}", Uuid::new_v4()))).unwrap();
        assert!(someone_else.authorize(&me).is_err());

        let unfiltered = Subscription::parse("notifications", None).unwrap();
        assert!(unfiltered.authorize(&me).is_err());
        assert!(unfiltered.authorize(&user(Role::Admin)).is_ok());

        let listings = Subscription::parse("properties", None).unwrap();
        assert!(listings.authorize(&me).is_ok());
    }

    #[test]
    fn matching_checks_table_and_column() {
        let sub = Subscription::parse("messages", Some("receiver_id=eq.42")).unwrap();
        assert!(sub.matches(&change("messages", json!({"receiver_id": "42"}))));
        assert!(sub.matches(&change("messages", json!({"receiver_id": 42}))));
        assert!(!sub.matches(&change("messages", json!({"receiver_id": "43"}))));
        assert!(!sub.matches(&change("notifications", json!({"receiver_id": "42"}))));
        assert!(!sub.matches(&change("messages", json!({"sender_id": "42"}))));
    }

    #[tokio::test]
    async fn published_changes_reach_subscribers() {
        let hub = RealtimeHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish("properties", ChangeEvent::Update, &json!({"id": "p1", "status": "reserved"}));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.table, "properties");
        assert_eq!(received.event, ChangeEvent::Update);
        assert_eq!(received.record["status"], "reserved");
    }

    #[tokio::test]
    async fn staged_changes_wait_for_publish() {
        let hub = RealtimeHub::new(8);
        let mut rx = hub.subscribe();
        let mut staged = StagedChanges::new();
        staged.stage("reservations", ChangeEvent::Update, &json!({"id": "r1", "status": "confirmed"}));
        staged.stage("properties", ChangeEvent::Update, &json!({"id": "p1", "status": "reserved"}));
        assert!(rx.try_recv().is_err());

        staged.publish(&hub);
        assert_eq!(rx.recv().await.unwrap().table, "reservations");
        assert_eq!(rx.recv().await.unwrap().table, "properties");
    }

    fn credit(hub: &RealtimeHub, commit: bool) -> Result<(), AppError> {
        let mut staged = StagedChanges::new();
        staged.stage("wallets", ChangeEvent::Update, &json!({"balance": 10}));
        if !commit {
            return Err(AppError::Conflict("rolled back".to_string()));
        }
        staged.publish(hub);
        Ok(())
    }

    #[test]
    fn rolled_back_changes_are_never_sent() {
        let hub = RealtimeHub::new(8);
        let mut rx = hub.subscribe();
        assert!(credit(&hub, false).is_err());
        assert!(rx.try_recv().is_err());
        credit(&hub, true).unwrap();
        assert_eq!(rx.try_recv().unwrap().table, "wallets");
    }
}
