use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

const INVALID_CREDENTIALS: &str = "Invalid email or password";
const EMAIL_NOT_CONFIRMED: &str = "Please confirm your email address before signing in";
const RATE_LIMITED: &str = "Too many attempts, please try again later";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{}", INVALID_CREDENTIALS)]
    InvalidCredentials,
    #[error("{}", EMAIL_NOT_CONFIRMED)]
    EmailNotConfirmed,
    #[error("{}", RATE_LIMITED)]
    RateLimited,
    #[error("Not signed in")]
    NotSignedIn,
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The server could not be reached at all.
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("{0}")]
    Validation(String),
    #[error("local storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl ClientError {
    /// Rebuilds the error the server reported from its status and JSON body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| body.trim().to_string());
        let lower = message.to_lowercase();

        if status == 429 || lower.contains("too many") || lower.contains("rate limit") {
            ClientError::RateLimited
        } else if lower.contains("invalid email or password") || lower.contains("invalid login credentials") {
            ClientError::InvalidCredentials
        } else if lower.contains("confirm your email") || lower.contains("email not confirmed") {
            ClientError::EmailNotConfirmed
        } else {
            ClientError::Api { status, message }
        }
    }

    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ClientError::Network(_) => "You appear to be offline".to_string(),
            ClientError::Timeout(what) => format!("{} took too long, please try again", what),
            ClientError::Api { status, .. } if *status >= 500 => "Something went wrong".to_string(),
            ClientError::Api { message, .. } => message.clone(),
            ClientError::Decode(_) | ClientError::Storage(_) | ClientError::Config(_) => {
                "Something went wrong".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout("Request")
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::Api { status: status.as_u16(), message: err.to_string() }
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// Races `fut` against a timer; losing the race is reported as [`ClientError::Timeout`].
pub async fn with_timeout<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(what)),
    }
}
