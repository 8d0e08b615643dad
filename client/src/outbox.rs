//! Messages that could not be sent, persisted to a JSON file and retried
//! until the server has them.
//!
//! Every entry carries a locally generated id that is sent as the message's
//! `client_ref`, and before anything is re-sent the user's recent server-side
//! messages are checked, so a message whose first attempt did reach the server
//! is never stored twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::api::MarketplaceApi;
use crate::conversation::{ChatMessage, DeliveryStatus};
use crate::error::ClientError;
use crate::models::{Message, OutgoingMessage};

pub const SYNC_PERIOD: Duration = Duration::from_secs(30);
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// How far apart a queued message and a server message may be created and
/// still count as the same message.
pub const DEDUP_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: message.local_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            property_id: message.property_id,
            content: message.content.clone(),
            created_at: message.created_at,
            status: DeliveryStatus::Sending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            local_id: self.id,
            server_id: None,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            property_id: self.property_id,
            content: self.content.clone(),
            created_at: self.created_at,
            status: self.status,
            is_read: false,
        }
    }

    fn outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            receiver_id: self.receiver_id,
            content: self.content.clone(),
            property_id: self.property_id,
            client_ref: self.id,
        }
    }

    /// Whether `message` is the server's copy of this entry.
    pub fn matches(&self, message: &Message) -> bool {
        if message.client_ref == Some(self.id) {
            return true;
        }
        message.sender_id == self.sender_id
            && message.receiver_id == self.receiver_id
            && message.content == self.content
            && (message.created_at - self.created_at).num_seconds().abs() <= DEDUP_WINDOW_SECS
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Another sync was running, or the last one finished too recently.
    pub skipped: bool,
    /// Entries now stored on the server, with the stored copy.
    pub delivered: Vec<(Uuid, Message)>,
    /// Entries that will be retried on the next sync.
    pub failed: Vec<Uuid>,
    /// Entries the server refused; they are dropped from the outbox.
    pub rejected: Vec<(Uuid, ClientError)>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.failed.is_empty() && self.rejected.is_empty()
    }
}

/// Clears the in-progress flag when a sync ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Outbox {
    path: PathBuf,
    entries: tokio::sync::Mutex<Vec<OutboxEntry>>,
    syncing: AtomicBool,
    last_sync: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl Outbox {
    /// Opens the outbox stored at `path`, starting empty when the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<OutboxEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("Ignoring unreadable outbox {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !entries.is_empty() {
            log::info!("Outbox holds {} unsent messages", entries.len());
        }
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
            syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            min_interval: MIN_SYNC_INTERVAL,
        })
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<(), ClientError> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return Ok(());
        }
        log::debug!("Queued message {} for {}", entry.id, entry.receiver_id);
        entries.push(entry);
        persist(&self.path, &entries).await
    }

    pub async fn pending(&self) -> Vec<OutboxEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn remove(&self, id: Uuid) -> Result<Option<OutboxEntry>, ClientError> {
        let mut entries = self.entries.lock().await;
        let Some(at) = entries.iter().position(|e| e.id == id) else {
            return Ok(None);
        };
        let removed = entries.remove(at);
        persist(&self.path, &entries).await?;
        Ok(Some(removed))
    }

    fn claim_slot(&self) -> bool {
        let mut last = match self.last_sync.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if matches!(*last, Some(at) if now.duration_since(at) < self.min_interval) {
            return false;
        }
        *last = Some(now);
        true
    }

    /// Delivers queued messages. Concurrent calls, and calls within the
    /// minimum interval of the previous one, return a skipped report.
    pub async fn sync(&self, api: &dyn MarketplaceApi) -> Result<SyncReport, ClientError> {
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            return Ok(SyncReport::skipped());
        };
        if !self.claim_slot() {
            return Ok(SyncReport::skipped());
        }

        let snapshot = self.pending().await;
        let Some(earliest) = snapshot.iter().map(|e| e.created_at).min() else {
            return Ok(SyncReport::default());
        };

        let confirmed = match api
            .sent_messages_since(earliest - chrono::Duration::seconds(DEDUP_WINDOW_SECS))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                let ids: Vec<Uuid> = snapshot.iter().map(|e| e.id).collect();
                self.record_failures(&ids, &e).await?;
                return Err(e);
            }
        };

        let mut report = SyncReport::default();
        let mut used: HashSet<Uuid> = HashSet::new();
        let mut last_error = None;
        for entry in &snapshot {
            if let Some(copy) = confirmed.iter().find(|m| !used.contains(&m.id) && entry.matches(m)) {
                used.insert(copy.id);
                report.delivered.push((entry.id, copy.clone()));
                continue;
            }
            match api.send_message(&entry.outgoing()).await {
                Ok(saved) => {
                    used.insert(saved.id);
                    report.delivered.push((entry.id, saved));
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("Queued message {} still not sent: {}", entry.id, e);
                    report.failed.push(entry.id);
                    last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("Server refused queued message {}: {}", entry.id, e);
                    report.rejected.push((entry.id, e));
                }
            }
        }

        let mut entries = self.entries.lock().await;
        entries.retain(|e| {
            !report.delivered.iter().any(|(id, _)| *id == e.id) && !report.rejected.iter().any(|(id, _)| *id == e.id)
        });
        if let Some(error) = &last_error {
            mark_failed(&mut entries, &report.failed, error);
        }
        persist(&self.path, &entries).await?;
        if !report.delivered.is_empty() {
            log::info!("Delivered {} queued messages, {} still queued", report.delivered.len(), entries.len());
        }
        Ok(report)
    }

    async fn record_failures(&self, ids: &[Uuid], error: &ClientError) -> Result<(), ClientError> {
        let mut entries = self.entries.lock().await;
        mark_failed(&mut entries, ids, error);
        persist(&self.path, &entries).await
    }

    /// Syncs now and then every `period` until the returned handle is dropped.
    pub fn spawn_sync_loop<F>(self: &Arc<Self>, api: Arc<dyn MarketplaceApi>, period: Duration, on_report: F) -> SyncLoop
    where
        F: Fn(SyncReport) + Send + Sync + 'static,
    {
        let outbox = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match outbox.sync(api.as_ref()).await {
                    Ok(report) if report.skipped || report.is_empty() => {}
                    Ok(report) => on_report(report),
                    Err(e) => log::warn!("Outbox sync failed: {}", e),
                }
            }
        });
        SyncLoop { handle }
    }
}

fn mark_failed(entries: &mut [OutboxEntry], ids: &[Uuid], error: &ClientError) {
    for entry in entries.iter_mut().filter(|e| ids.contains(&e.id)) {
        entry.status = DeliveryStatus::Failed;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
    }
}

/// Writes the entries to a sibling file first so a crash never leaves half a file behind.
async fn persist(path: &Path, entries: &[OutboxEntry]) -> Result<(), ClientError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(entries).map_err(|e| ClientError::Storage(e.to_string()))?;
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// The periodic sync task. Dropping it stops the task.
pub struct SyncLoop {
    handle: JoinHandle<()>,
}

impl SyncLoop {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
