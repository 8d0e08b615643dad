use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::api::MarketplaceApi;
use crate::error::{with_timeout, ClientError};
use crate::models::{Page, Property, PropertyQuery};

pub const CATALOG_TTL: Duration = Duration::from_secs(60);
const CATALOG_CAPACITY: u64 = 200;
const QUERY_LIMIT: Duration = Duration::from_secs(15);

/// Listing searches, cached briefly by their normalised filter.
#[derive(Clone)]
pub struct PropertyCatalog {
    api: Arc<dyn MarketplaceApi>,
    cache: Cache<String, Arc<Page<Property>>>,
}

impl PropertyCatalog {
    pub fn new(api: Arc<dyn MarketplaceApi>) -> Self {
        Self::with_ttl(api, CATALOG_TTL)
    }

    pub fn with_ttl(api: Arc<dyn MarketplaceApi>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(CATALOG_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { api, cache }
    }

    fn cache_key(query: &PropertyQuery) -> Result<String, ClientError> {
        serde_json::to_string(query).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn search(&self, query: &PropertyQuery) -> Result<Arc<Page<Property>>, ClientError> {
        let query = query.normalized();
        if let (Some(min), Some(max)) = (query.min_price, query.max_price) {
            if min > max {
                return Err(ClientError::Validation("Minimum price cannot exceed maximum price".to_string()));
            }
        }
        let key = Self::cache_key(&query)?;
        let api = self.api.as_ref();
        self.cache
            .try_get_with(key, async move {
                let page = with_timeout("Property search", QUERY_LIMIT, api.list_properties(&query)).await?;
                Ok::<_, ClientError>(Arc::new(page))
            })
            .await
            .map_err(|e: Arc<ClientError>| Arc::try_unwrap(e).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Forgets every cached search, e.g. after the user edited a listing.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn equivalent_searches_share_a_cache_entry() {
        let api = Arc::new(FakeApi::new());
        let catalog = PropertyCatalog::new(api.clone());
        let a = PropertyQuery { city: Some("Kampala ".to_string()), ..Default::default() };
        let b = PropertyQuery { city: Some("kampala".to_string()), ..Default::default() };

        let first = catalog.search(&a).await.unwrap();
        let second = catalog.search(&b).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.items[0].city, "kampala");
        assert_eq!(api.property_fetches.load(Ordering::SeqCst), 1);

        let other = PropertyQuery { city: Some("entebbe".to_string()), ..Default::default() };
        catalog.search(&other).await.unwrap();
        assert_eq!(api.property_fetches.load(Ordering::SeqCst), 2);

        catalog.invalidate_all();
        catalog.search(&a).await.unwrap();
        assert_eq!(api.property_fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn inverted_price_range_is_rejected_locally() {
        let api = Arc::new(FakeApi::new());
        let catalog = PropertyCatalog::new(api.clone());
        let query = PropertyQuery { min_price: Some(500), max_price: Some(100), ..Default::default() };
        assert!(matches!(catalog.search(&query).await, Err(ClientError::Validation(_))));
        assert_eq!(api.property_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cached_results_expire() {
        let api = Arc::new(FakeApi::new());
        let catalog = PropertyCatalog::with_ttl(api.clone(), Duration::from_millis(50));
        let query = PropertyQuery::default();
        catalog.search(&query).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        catalog.search(&query).await.unwrap();
        assert_eq!(api.property_fetches.load(Ordering::SeqCst), 2);
    }
}
