//! In-memory [`MarketplaceApi`] used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::MarketplaceApi;
use crate::error::ClientError;
use crate::models::{
    AuthSession, CodePurpose, Message, OutgoingMessage, Page, Profile, Property, PropertyQuery, SignUp, Verified,
};

pub struct FakeApi {
    pub me: Uuid,
    pub online: AtomicBool,
    /// Sends are stored but reported as failed, as when a response is lost.
    pub lose_responses: AtomicBool,
    pub reject_sends: AtomicBool,
    pub latency: Duration,
    pub profile_fetches: AtomicUsize,
    pub property_fetches: AtomicUsize,
    pub sent_queries: AtomicUsize,
    pub send_attempts: AtomicUsize,
    pub server_messages: Mutex<Vec<Message>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            me: Uuid::new_v4(),
            online: AtomicBool::new(true),
            lose_responses: AtomicBool::new(false),
            reject_sends: AtomicBool::new(false),
            latency: Duration::ZERO,
            profile_fetches: AtomicUsize::new(0),
            property_fetches: AtomicUsize::new(0),
            sent_queries: AtomicUsize::new(0),
            send_attempts: AtomicUsize::new(0),
            server_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<Message> {
        self.server_messages.lock().unwrap().clone()
    }

    /// Records a message as if it had been sent from another device.
    pub fn insert_remote(&self, receiver_id: Uuid, content: &str, created_at: DateTime<Utc>) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: self.me,
            receiver_id,
            property_id: None,
            content: content.to_string(),
            is_read: false,
            client_ref: None,
            created_at,
        };
        self.server_messages.lock().unwrap().push(message.clone());
        message
    }

    async fn round_trip(&self) -> Result<(), ClientError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::Network("connection refused".to_string()))
        }
    }

    fn profile(&self, id: Uuid) -> Profile {
        Profile {
            id,
            full_name: "Test User".to_string(),
            avatar_url: None,
            role: "user".to_string(),
            is_verified: false,
            email: Some("test@example.com".to_string()),
            phone: None,
        }
    }
}

#[async_trait]
impl MarketplaceApi for FakeApi {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ClientError> {
        self.round_trip().await?;
        if password != "correct horse" {
            return Err(ClientError::InvalidCredentials);
        }
        let mut user = self.profile(self.me);
        user.email = Some(email.to_string());
        Ok(AuthSession { access_token: "token".to_string(), expires_in: 86_400, user })
    }

    async fn sign_up(&self, request: &SignUp) -> Result<Profile, ClientError> {
        self.round_trip().await?;
        let mut profile = self.profile(Uuid::new_v4());
        profile.full_name = request.full_name.clone();
        Ok(profile)
    }

    async fn verify_code(&self, email: &str, code: &str, purpose: CodePurpose) -> Result<Verified, ClientError> {
        self.round_trip().await?;
        if code != "123456" {
            return Err(ClientError::Api { status: 400, message: "Invalid or expired code".to_string() });
        }
        Ok(match purpose {
            CodePurpose::Signup => Verified::Session(self.sign_in(email, "correct horse").await?),
            CodePurpose::Recovery => Verified::ResetToken("reset".to_string()),
        })
    }

    async fn resend_code(&self, _email: &str, _purpose: CodePurpose) -> Result<(), ClientError> {
        self.round_trip().await
    }

    async fn request_password_reset(&self, _email: &str) -> Result<(), ClientError> {
        self.round_trip().await
    }

    async fn reset_password(&self, _reset_token: &str, _new_password: &str) -> Result<(), ClientError> {
        self.round_trip().await
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Profile, ClientError> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        Ok(self.profile(id))
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ClientError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Api { status: 400, message: "Message content is required".to_string() });
        }
        let mut stored = self.server_messages.lock().unwrap();
        if let Some(existing) = stored.iter().find(|m| m.client_ref == Some(message.client_ref)) {
            return Ok(existing.clone());
        }
        let saved = Message {
            id: Uuid::new_v4(),
            sender_id: self.me,
            receiver_id: message.receiver_id,
            property_id: message.property_id,
            content: message.content.clone(),
            is_read: false,
            client_ref: Some(message.client_ref),
            created_at: Utc::now(),
        };
        stored.push(saved.clone());
        drop(stored);
        if self.lose_responses.load(Ordering::SeqCst) {
            return Err(ClientError::Network("connection reset".to_string()));
        }
        Ok(saved)
    }

    async fn sent_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        self.sent_queries.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        let stored = self.server_messages.lock().unwrap();
        Ok(stored.iter().filter(|m| m.created_at >= since).cloned().collect())
    }

    async fn list_properties(&self, query: &PropertyQuery) -> Result<Page<Property>, ClientError> {
        self.property_fetches.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        let city = query.city.clone().unwrap_or_else(|| "kampala".to_string());
        let item = Property {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            agent_id: None,
            title: "Two bedroom apartment".to_string(),
            description: "Close to the city centre".to_string(),
            property_type: "apartment".to_string(),
            listing_type: "rent".to_string(),
            status: "available".to_string(),
            price: 1_200_000,
            currency: "UGX".to_string(),
            city,
            address: "Plot 4".to_string(),
            latitude: None,
            longitude: None,
            bedrooms: 2,
            bathrooms: 1,
            area_sqm: Some(80),
            amenities: vec![],
            images: vec![],
            is_featured: false,
            created_at: Utc::now(),
        };
        Ok(Page { items: vec![item], total: 1 })
    }
}
