use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::ClientError;

#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    /// Base url of the marketplace backend, without a trailing slash.
    pub api_url: String,
    /// Public key sent as the `apikey` header, when the deployment requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_outbox_path")]
    pub outbox_path: PathBuf,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_outbox_path() -> PathBuf {
    PathBuf::from("marketplace-outbox.json")
}

fn default_sync_interval_secs() -> u64 {
    30
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            outbox_path: default_outbox_path(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_outbox_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.outbox_path = path.into();
        self
    }

    /// Reads `MARKETPLACE_API_URL`, `MARKETPLACE_API_KEY` and the optional
    /// `MARKETPLACE_*` tunables from the process environment.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_environment(Environment::with_prefix("MARKETPLACE"))
    }

    fn from_environment(env: Environment) -> Result<Self, ClientError> {
        let mut config: ClientConfig = Config::builder()
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if !(config.api_url.starts_with("http://") || config.api_url.starts_with("https://")) {
            return Err(ClientError::Config("MARKETPLACE_API_URL must be an http(s) url".to_string()));
        }
        config.api_key = config.api_key.filter(|key| !key.trim().is_empty());
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("outbox_path", &self.outbox_path)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ClientConfig, ClientError> {
        let source: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ClientConfig::from_environment(Environment::with_prefix("MARKETPLACE").source(Some(source)))
    }

    #[test]
    fn reads_prefixed_environment() {
        let config = from_pairs(&[
            ("MARKETPLACE_API_URL", "https://api.example.com/"),
            ("MARKETPLACE_API_KEY", "anon-key"),
        ])
        .unwrap();
        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn url_is_required_and_checked() {
        assert!(from_pairs(&[]).is_err());
        assert!(from_pairs(&[("MARKETPLACE_API_URL", "api.example.com")]).is_err());
    }

    #[test]
    fn debug_hides_the_key() {
        let config = ClientConfig::new("http://localhost:8080/").with_api_key("secret-key");
        assert_eq!(config.api_url, "http://localhost:8080");
        assert!(!format!("{:?}", config).contains("secret-key"));
    }
}
