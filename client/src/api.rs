//! The backend seam. [`HttpApi`] is the reqwest implementation; tests drive
//! the rest of the crate through fakes of [`MarketplaceApi`].

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::models::{
    AuthSession, CodePurpose, Message, OutgoingMessage, Page, Profile, Property, PropertyQuery, SignUp, Verified,
};

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ClientError>;

    /// Registers an account; a confirmation code is sent to the address.
    async fn sign_up(&self, request: &SignUp) -> Result<Profile, ClientError>;

    async fn verify_code(&self, email: &str, code: &str, purpose: CodePurpose) -> Result<Verified, ClientError>;

    async fn resend_code(&self, email: &str, purpose: CodePurpose) -> Result<(), ClientError>;

    async fn request_password_reset(&self, email: &str) -> Result<(), ClientError>;

    async fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), ClientError>;

    fn sign_out(&self) {}

    /// The full profile for the signed-in user, the public one for anyone else.
    async fn fetch_profile(&self, id: Uuid) -> Result<Profile, ClientError>;

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ClientError>;

    /// Messages the signed-in user sent at or after `since`, oldest first.
    async fn sent_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError>;

    async fn list_properties(&self, query: &PropertyQuery) -> Result<Page<Property>, ClientError>;
}

struct Credentials {
    token: String,
    user_id: Uuid,
}

pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
    credentials: RwLock<Option<Credentials>>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| ClientError::Config("API key is not a valid header value".to_string()))?;
            headers.insert("apikey", value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { base_url: config.api_url.clone(), client, credentials: RwLock::new(None) })
    }

    /// Reuses a token obtained earlier, e.g. restored from disk.
    pub fn restore(&self, token: String, user_id: Uuid) {
        self.store(Some(Credentials { token, user_id }));
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.credentials.read().ok()?.as_ref().map(|c| c.user_id)
    }

    fn store(&self, credentials: Option<Credentials>) {
        match self.credentials.write() {
            Ok(mut guard) => *guard = credentials,
            Err(poisoned) => *poisoned.into_inner() = credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let guard = self.credentials.read().map_err(|_| ClientError::NotSignedIn)?;
        let credentials = guard.as_ref().ok_or(ClientError::NotSignedIn)?;
        Ok(request.bearer_auth(&credentials.token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::debug!("Request failed with {}: {}", status, body);
        Err(ClientError::from_response(status.as_u16(), &body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        response.json::<T>().await.map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn open_session(&self, session: &AuthSession) {
        self.store(Some(Credentials { token: session.access_token.clone(), user_id: session.user.id }));
    }
}

#[derive(Deserialize)]
struct SignUpResponse {
    user: Profile,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VerifyResponse {
    Session(AuthSession),
    Reset { reset_token: String },
}

#[async_trait]
impl MarketplaceApi for HttpApi {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ClientError> {
        let request = self
            .client
            .post(self.url("/auth/signin"))
            .json(&json!({ "email": email, "password": password }));
        let session: AuthSession = self.json(request).await?;
        self.open_session(&session);
        log::info!("Signed in as {}", session.user.id);
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUp) -> Result<Profile, ClientError> {
        let request = self.client.post(self.url("/auth/signup")).json(request);
        let response: SignUpResponse = self.json(request).await?;
        Ok(response.user)
    }

    async fn verify_code(&self, email: &str, code: &str, purpose: CodePurpose) -> Result<Verified, ClientError> {
        let request = self
            .client
            .post(self.url("/auth/verify"))
            .json(&json!({ "email": email, "code": code, "purpose": purpose }));
        match self.json::<VerifyResponse>(request).await? {
            VerifyResponse::Session(session) => {
                self.open_session(&session);
                Ok(Verified::Session(session))
            }
            VerifyResponse::Reset { reset_token } => Ok(Verified::ResetToken(reset_token)),
        }
    }

    async fn resend_code(&self, email: &str, purpose: CodePurpose) -> Result<(), ClientError> {
        let request = self
            .client
            .post(self.url("/auth/otp/resend"))
            .json(&json!({ "email": email, "purpose": purpose }));
        self.send(request).await?;
        Ok(())
    }

    async fn request_password_reset(&self, email: &str) -> Result<(), ClientError> {
        let request = self
            .client
            .post(self.url("/auth/password/forgot"))
            .json(&json!({ "email": email }));
        self.send(request).await?;
        Ok(())
    }

    async fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), ClientError> {
        let request = self
            .client
            .post(self.url("/auth/password/reset"))
            .json(&json!({ "reset_token": reset_token, "new_password": new_password }));
        self.send(request).await?;
        Ok(())
    }

    fn sign_out(&self) {
        self.store(None);
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Profile, ClientError> {
        let request = if self.user_id() == Some(id) {
            self.authorized(self.client.get(self.url("/me")))?
        } else {
            self.client.get(self.url(&format!("/profiles/{}", id)))
        };
        self.json(request).await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ClientError> {
        let request = self.authorized(self.client.post(self.url("/messages")).json(message))?;
        self.json(request).await
    }

    async fn sent_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        let request = self.authorized(
            self.client
                .get(self.url("/messages/sent"))
                .query(&[("since", since.to_rfc3339()), ("limit", "500".to_string())]),
        )?;
        self.json(request).await
    }

    async fn list_properties(&self, query: &PropertyQuery) -> Result<Page<Property>, ClientError> {
        let request = self.client.get(self.url("/properties")).query(query);
        self.json(request).await
    }
}
