//! The message list of one conversation, including messages that have not
//! reached the server yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClientError;
use crate::models::Message;

pub const MAX_CONTENT_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Generated locally; sent to the server as the message's `client_ref`.
    pub local_id: Uuid,
    pub server_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub property_id: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub is_read: bool,
}

impl ChatMessage {
    fn from_server(message: &Message) -> Self {
        Self {
            local_id: message.client_ref.unwrap_or(message.id),
            server_id: Some(message.id),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            property_id: message.property_id,
            content: message.content.clone(),
            created_at: message.created_at,
            status: DeliveryStatus::Sent,
            is_read: message.is_read,
        }
    }

    fn absorb(&mut self, message: &Message) {
        self.server_id = Some(message.id);
        self.created_at = message.created_at;
        self.status = DeliveryStatus::Sent;
        self.is_read = message.is_read;
    }
}

pub fn clean_content(raw: &str) -> Result<String, ClientError> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(ClientError::Validation("Message content is required".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ClientError::Validation(format!(
            "Messages are limited to {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(content.to_string())
}

#[derive(Debug, Clone)]
pub struct Conversation {
    me: Uuid,
    other: Uuid,
    property_id: Option<Uuid>,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(me: Uuid, other: Uuid) -> Self {
        Self { me, other, property_id: None, messages: Vec::new() }
    }

    /// Ties messages sent from this conversation to a listing.
    pub fn about_property(mut self, property_id: Uuid) -> Self {
        self.property_id = Some(property_id);
        self
    }

    pub fn me(&self) -> Uuid {
        self.me
    }

    pub fn other(&self) -> Uuid {
        self.other
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, local_id: Uuid) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.local_id == local_id)
    }

    /// Messages still waiting for the server.
    pub fn undelivered(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.status != DeliveryStatus::Sent)
    }

    fn involves(&self, message: &Message) -> bool {
        (message.sender_id == self.me && message.receiver_id == self.other)
            || (message.sender_id == self.other && message.receiver_id == self.me)
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let at = self.messages.partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    fn resort(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Appends a message from the current user before the server has seen it.
    pub fn push_optimistic(&mut self, content: &str) -> Result<ChatMessage, ClientError> {
        let message = ChatMessage {
            local_id: Uuid::new_v4(),
            server_id: None,
            sender_id: self.me,
            receiver_id: self.other,
            property_id: self.property_id,
            content: clean_content(content)?,
            created_at: Utc::now(),
            status: DeliveryStatus::Sending,
            is_read: false,
        };
        self.insert_sorted(message.clone());
        Ok(message)
    }

    /// Replaces an optimistic message with the server's copy. Returns false
    /// when `local_id` is unknown.
    pub fn confirm(&mut self, local_id: Uuid, saved: &Message) -> bool {
        if let Some(duplicate) = self
            .messages
            .iter()
            .position(|m| m.server_id == Some(saved.id) && m.local_id != local_id)
        {
            // The realtime feed delivered the row before the send returned.
            self.messages.remove(duplicate);
        }
        let Some(message) = self.messages.iter_mut().find(|m| m.local_id == local_id) else {
            return false;
        };
        message.absorb(saved);
        self.resort();
        true
    }

    pub fn mark_failed(&mut self, local_id: Uuid) -> bool {
        match self.messages.iter_mut().find(|m| m.local_id == local_id) {
            Some(message) if message.status != DeliveryStatus::Sent => {
                message.status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Puts a failed message back into the sending state before a retry.
    pub fn mark_sending(&mut self, local_id: Uuid) -> bool {
        match self.messages.iter_mut().find(|m| m.local_id == local_id) {
            Some(message) if message.status == DeliveryStatus::Failed => {
                message.status = DeliveryStatus::Sending;
                true
            }
            _ => false,
        }
    }

    /// Merges a message delivered by the server, from a fetch or the realtime
    /// feed. Known messages are updated in place rather than duplicated.
    pub fn apply_remote(&mut self, message: &Message) -> bool {
        if !self.involves(message) {
            return false;
        }
        if let Some(existing) = self.messages.iter_mut().find(|m| m.server_id == Some(message.id)) {
            existing.is_read = message.is_read;
            return true;
        }
        if let Some(local_id) = message.client_ref {
            if self.confirm(local_id, message) {
                return true;
            }
        }
        self.insert_sorted(ChatMessage::from_server(message));
        true
    }

    /// Re-adds an undelivered message kept across restarts.
    pub fn restore(&mut self, message: ChatMessage) -> bool {
        let ours = message.sender_id == self.me && message.receiver_id == self.other;
        if !ours || self.get(message.local_id).is_some() {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Replaces the history with a freshly fetched page, keeping local
    /// messages the page does not contain yet.
    pub fn load(&mut self, history: &[Message]) {
        let pending: Vec<ChatMessage> = self.undelivered().cloned().collect();
        self.messages.clear();
        for message in history {
            self.apply_remote(message);
        }
        for message in pending {
            if self.get(message.local_id).is_none() {
                self.insert_sorted(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn server_copy(local: &ChatMessage) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: local.sender_id,
            receiver_id: local.receiver_id,
            property_id: local.property_id,
            content: local.content.clone(),
            is_read: false,
            client_ref: Some(local.local_id),
            created_at: local.created_at + Duration::milliseconds(120),
        }
    }

    fn incoming(conversation: &Conversation, content: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: conversation.other(),
            receiver_id: conversation.me(),
            property_id: None,
            content: content.to_string(),
            is_read: false,
            client_ref: None,
            created_at: at,
        }
    }

    #[test]
    fn optimistic_message_is_confirmed_in_place() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        let local = conversation.push_optimistic("  Is it still available?  ").unwrap();
        assert_eq!(local.status, DeliveryStatus::Sending);
        assert_eq!(local.content, "Is it still available?");

        let saved = server_copy(&local);
        assert!(conversation.confirm(local.local_id, &saved));
        let messages = conversation.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
        assert_eq!(messages[0].server_id, Some(saved.id));
        assert!(!conversation.confirm(Uuid::new_v4(), &saved));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(conversation.push_optimistic("   ").is_err());
        assert!(conversation.push_optimistic(&"x".repeat(MAX_CONTENT_CHARS + 1)).is_err());
        assert!(conversation.messages().is_empty());
    }

    #[test]
    fn remote_echo_of_own_message_is_not_duplicated() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        let local = conversation.push_optimistic("hello").unwrap();
        let saved = server_copy(&local);

        // Realtime delivers the row, then the send call returns.
        assert!(conversation.apply_remote(&saved));
        assert!(conversation.confirm(local.local_id, &saved));
        assert!(conversation.apply_remote(&saved));
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.undelivered().count(), 0);
    }

    #[test]
    fn remote_messages_are_ordered_and_filtered() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let later = incoming(&conversation, "second", now);
        let earlier = incoming(&conversation, "first", now - Duration::minutes(5));
        conversation.apply_remote(&later);
        conversation.apply_remote(&earlier);
        let contents: Vec<&str> = conversation.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);

        let mut unrelated = incoming(&conversation, "elsewhere", now);
        unrelated.sender_id = Uuid::new_v4();
        assert!(!conversation.apply_remote(&unrelated));

        let mut read = later.clone();
        read.is_read = true;
        conversation.apply_remote(&read);
        assert_eq!(conversation.messages().len(), 2);
        assert!(conversation.messages()[1].is_read);
    }

    #[test]
    fn failure_and_retry_states() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        let local = conversation.push_optimistic("offer").unwrap();
        assert!(conversation.mark_failed(local.local_id));
        assert_eq!(conversation.get(local.local_id).unwrap().status, DeliveryStatus::Failed);
        assert!(conversation.mark_sending(local.local_id));
        conversation.confirm(local.local_id, &server_copy(&local));
        assert!(!conversation.mark_failed(local.local_id));
    }

    #[test]
    fn reload_keeps_undelivered_messages() {
        let mut conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4());
        let pending = conversation.push_optimistic("queued while offline").unwrap();
        let history = vec![incoming(&conversation, "hi", Utc::now() - Duration::hours(1))];
        conversation.load(&history);
        assert_eq!(conversation.messages().len(), 2);
        assert_eq!(conversation.messages()[1].local_id, pending.local_id);
    }
}
