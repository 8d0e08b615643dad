use std::time::Duration;

use moka::future::Cache;

use crate::error::AppError;

/// Counts failed attempts per key inside a sliding window.
#[derive(Clone)]
pub struct AttemptLimiter {
    attempts: Cache<String, u32>,
    max_attempts: u32,
}

impl AttemptLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        let attempts = Cache::builder().max_capacity(100_000).time_to_live(window).build();
        Self { attempts, max_attempts }
    }

    fn key(raw: &str) -> String {
        raw.trim().to_lowercase()
    }

    pub async fn check(&self, key: &str) -> Result<(), AppError> {
        let count = self.attempts.get(&Self::key(key)).await.unwrap_or(0);
        if count >= self.max_attempts {
            return Err(AppError::RateLimited);
        }
        Ok(())
    }

    pub async fn record_failure(&self, key: &str) {
        let key = Self::key(key);
        let count = self.attempts.get(&key).await.unwrap_or(0);
        self.attempts.insert(key, count.saturating_add(1)).await;
    }

    pub async fn reset(&self, key: &str) {
        self.attempts.invalidate(&Self::key(key)).await;
    }
}
