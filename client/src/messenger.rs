use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::api::MarketplaceApi;
use crate::config::ClientConfig;
use crate::conversation::{ChatMessage, Conversation, DeliveryStatus};
use crate::error::{with_timeout, ClientError};
use crate::models::OutgoingMessage;
use crate::outbox::{Outbox, OutboxEntry, SyncLoop, SyncReport, SYNC_PERIOD};

const SEND_LIMIT: Duration = Duration::from_secs(10);

/// Sends chat messages, queueing them in the [`Outbox`] while the backend is
/// unreachable.
#[derive(Clone)]
pub struct Messenger {
    api: Arc<dyn MarketplaceApi>,
    outbox: Arc<Outbox>,
    sync_interval: Duration,
}

impl Messenger {
    pub fn new(api: Arc<dyn MarketplaceApi>, outbox: Arc<Outbox>) -> Self {
        Self { api, outbox, sync_interval: SYNC_PERIOD }
    }

    /// Opens the outbox at `config.outbox_path` and syncs it every
    /// `config.sync_interval()`.
    pub async fn from_config(config: &ClientConfig, api: Arc<dyn MarketplaceApi>) -> Result<Self, ClientError> {
        let outbox = Outbox::open(config.outbox_path.clone()).await?;
        Ok(Self { api, outbox: Arc::new(outbox), sync_interval: config.sync_interval() })
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// Starts the periodic outbox sync; it stops when the handle is dropped.
    pub fn spawn_sync<F>(&self, on_report: F) -> SyncLoop
    where
        F: Fn(SyncReport) + Send + Sync + 'static,
    {
        self.outbox.spawn_sync_loop(Arc::clone(&self.api), self.sync_interval, on_report)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Shows the message at once and delivers it. A connectivity failure
    /// leaves it `Sending` in the outbox; a refusal marks it `Failed`.
    pub async fn send(&self, conversation: &mut Conversation, content: &str) -> Result<ChatMessage, ClientError> {
        let local = conversation.push_optimistic(content)?;
        self.deliver(conversation, local).await
    }

    /// Sends a failed message again.
    pub async fn retry(&self, conversation: &mut Conversation, local_id: Uuid) -> Result<ChatMessage, ClientError> {
        let local = conversation
            .get(local_id)
            .filter(|m| m.status == DeliveryStatus::Failed)
            .cloned()
            .ok_or_else(|| ClientError::Validation("Only failed messages can be retried".to_string()))?;
        self.outbox.remove(local_id).await?;
        conversation.mark_sending(local_id);
        self.deliver(conversation, local).await
    }

    async fn deliver(&self, conversation: &mut Conversation, local: ChatMessage) -> Result<ChatMessage, ClientError> {
        let outgoing = OutgoingMessage {
            receiver_id: local.receiver_id,
            content: local.content.clone(),
            property_id: local.property_id,
            client_ref: local.local_id,
        };
        match with_timeout("Sending the message", SEND_LIMIT, self.api.send_message(&outgoing)).await {
            Ok(saved) => {
                conversation.confirm(local.local_id, &saved);
                Ok(conversation.get(local.local_id).cloned().unwrap_or(local))
            }
            Err(e) if e.is_retryable() => {
                log::warn!("Message {} queued for later: {}", local.local_id, e);
                self.outbox.enqueue(OutboxEntry::from_message(&local)).await?;
                Ok(conversation.get(local.local_id).cloned().unwrap_or(local))
            }
            Err(e) => {
                conversation.mark_failed(local.local_id);
                Err(e)
            }
        }
    }

    /// Shows queued messages that belong to `conversation`, e.g. after a restart.
    pub async fn restore_pending(&self, conversation: &mut Conversation) -> usize {
        self.outbox
            .pending()
            .await
            .iter()
            .filter(|entry| conversation.restore(entry.to_message()))
            .count()
    }

    pub async fn sync(&self) -> Result<SyncReport, ClientError> {
        self.outbox.sync(self.api.as_ref()).await
    }
}

/// Reflects the outcome of an outbox sync in a conversation.
pub fn apply_report(conversation: &mut Conversation, report: &SyncReport) {
    for (local_id, saved) in &report.delivered {
        conversation.confirm(*local_id, saved);
    }
    for local_id in report.failed.iter().chain(report.rejected.iter().map(|(id, _)| id)) {
        conversation.mark_failed(*local_id);
    }
}
