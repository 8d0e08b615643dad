use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::api::MarketplaceApi;
use crate::error::{with_timeout, ClientError};
use crate::models::{CodePurpose, Profile, SignUp, Verified};

pub const PROFILE_TTL: Duration = Duration::from_secs(5 * 60);
const PROFILE_CACHE_CAPACITY: u64 = 1_000;
const PROFILE_FETCH_LIMIT: Duration = Duration::from_secs(10);

/// Profiles by id, kept for a short TTL. Concurrent lookups of the same id
/// share one in-flight fetch.
#[derive(Clone)]
pub struct ProfileCache {
    cache: Cache<Uuid, Profile>,
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new(PROFILE_TTL)
    }
}

impl ProfileCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(PROFILE_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub async fn get_or_fetch(&self, api: &dyn MarketplaceApi, id: Uuid) -> Result<Profile, ClientError> {
        self.cache
            .try_get_with(id, async move {
                with_timeout("Profile fetch", PROFILE_FETCH_LIMIT, api.fetch_profile(id)).await
            })
            .await
            .map_err(|e: Arc<ClientError>| Arc::try_unwrap(e).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub async fn insert(&self, profile: Profile) {
        self.cache.insert(profile.id, profile).await;
    }

    pub async fn invalidate(&self, id: Uuid) {
        self.cache.invalidate(&id).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

/// The signed-in user and the auth flows around it.
pub struct Session {
    api: Arc<dyn MarketplaceApi>,
    profiles: ProfileCache,
    user_id: RwLock<Option<Uuid>>,
}

impl Session {
    pub fn new(api: Arc<dyn MarketplaceApi>) -> Self {
        Self::with_cache(api, ProfileCache::default())
    }

    pub fn with_cache(api: Arc<dyn MarketplaceApi>, profiles: ProfileCache) -> Self {
        Self { api, profiles, user_id: RwLock::new(None) }
    }

    pub fn api(&self) -> &Arc<dyn MarketplaceApi> {
        &self.api
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.profiles
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id.read().ok().and_then(|guard| *guard)
    }

    fn set_user(&self, id: Option<Uuid>) {
        match self.user_id.write() {
            Ok(mut guard) => *guard = id,
            Err(poisoned) => *poisoned.into_inner() = id,
        }
    }

    async fn open(&self, profile: Profile) -> Profile {
        self.set_user(Some(profile.id));
        self.profiles.insert(profile.clone()).await;
        profile
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Profile, ClientError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::Validation("Email and password are required".to_string()));
        }
        let session = self.api.sign_in(&email, password).await?;
        Ok(self.open(session.user).await)
    }

    /// Registers an account. The user signs in by confirming the e-mailed code.
    pub async fn sign_up(&self, request: &SignUp) -> Result<Profile, ClientError> {
        self.api.sign_up(request).await
    }

    /// Confirms a sign-up code and opens the resulting session.
    pub async fn confirm_email(&self, email: &str, code: &str) -> Result<Profile, ClientError> {
        match self.api.verify_code(email, code.trim(), CodePurpose::Signup).await? {
            Verified::Session(session) => Ok(self.open(session.user).await),
            Verified::ResetToken(_) => Err(ClientError::Decode("expected a session".to_string())),
        }
    }

    pub async fn resend_confirmation(&self, email: &str) -> Result<(), ClientError> {
        self.api.resend_code(email, CodePurpose::Signup).await
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ClientError> {
        self.api.request_password_reset(email).await
    }

    /// Exchanges a recovery code for a new password.
    pub async fn reset_password(&self, email: &str, code: &str, new_password: &str) -> Result<(), ClientError> {
        match self.api.verify_code(email, code.trim(), CodePurpose::Recovery).await? {
            Verified::ResetToken(token) => self.api.reset_password(&token, new_password).await,
            Verified::Session(_) => Err(ClientError::Decode("expected a reset token".to_string())),
        }
    }

    pub async fn sign_out(&self) {
        if let Some(id) = self.user_id() {
            self.profiles.invalidate(id).await;
        }
        self.set_user(None);
        self.api.sign_out();
    }

    pub async fn current_profile(&self) -> Result<Profile, ClientError> {
        let id = self.user_id().ok_or(ClientError::NotSignedIn)?;
        self.profiles.get_or_fetch(self.api.as_ref(), id).await
    }

    /// Drops the cached profile, e.g. after the user edited it.
    pub async fn invalidate(&self) {
        if let Some(id) = self.user_id() {
            self.profiles.invalidate(id).await;
        }
    }

    pub async fn profile(&self, id: Uuid) -> Result<Profile, ClientError> {
        self.profiles.get_or_fetch(self.api.as_ref(), id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use std::sync::atomic::Ordering;

    fn session(api: &Arc<FakeApi>) -> Session {
        Session::new(api.clone())
    }

    #[tokio::test]
    async fn cached_profile_is_reused() {
        let api = Arc::new(FakeApi::new());
        let session = session(&api);
        assert!(matches!(session.current_profile().await, Err(ClientError::NotSignedIn)));

        session.sign_in("Me@Example.com", "correct horse").await.unwrap();
        session.current_profile().await.unwrap();
        session.current_profile().await.unwrap();
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 0);

        session.invalidate().await;
        let profile = session.current_profile().await.unwrap();
        assert_eq!(profile.id, api.me);
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 1);
        session.current_profile().await.unwrap();
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fetches_share_one_request() {
        let api = Arc::new(FakeApi::new().with_latency(Duration::from_millis(200)));
        let cache = ProfileCache::default();
        let id = Uuid::new_v4();
        let (a, b, c) = tokio::join!(
            cache.get_or_fetch(api.as_ref(), id),
            cache.get_or_fetch(api.as_ref(), id),
            cache.get_or_fetch(api.as_ref(), id),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_expire_after_the_ttl() {
        let api = FakeApi::new();
        let cache = ProfileCache::new(Duration::from_millis(50));
        let id = Uuid::new_v4();
        cache.get_or_fetch(&api, id).await.unwrap();
        cache.get_or_fetch(&api, id).await.unwrap();
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.get_or_fetch(&api, id).await.unwrap();
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetches_are_not_cached() {
        let api = FakeApi::new();
        let cache = ProfileCache::default();
        let id = Uuid::new_v4();
        api.set_online(false);
        let err = cache.get_or_fetch(&api, id).await.unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));

        api.set_online(true);
        cache.get_or_fetch(&api, id).await.unwrap();
        assert_eq!(api.profile_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_flows() {
        let api = Arc::new(FakeApi::new());
        let session = session(&api);
        let err = session.sign_in("me@example.com", "wrong").await.unwrap_err();
        assert_eq!(err.user_message(), "Invalid email or password");
        assert!(session.sign_in("", "x").await.is_err());

        let profile = session.confirm_email("me@example.com", " 123456 ").await.unwrap();
        assert_eq!(session.user_id(), Some(profile.id));
        session.reset_password("me@example.com", "123456", "new password 1").await.unwrap();

        session.sign_out().await;
        assert_eq!(session.user_id(), None);
    }
}
