//! Product catalog synchronizer.
//!
//! Refreshes the local catalog cache from the backend. A refresh prefers one
//! bulk fetch and verifies it against the server-reported total, falling back
//! to page-by-page fetching when the bulk response is incomplete or the count
//! cannot be verified. Guards keep refreshes cheap and race-free: a per-store
//! in-flight set, a freshness threshold, a cooldown window, and a bounded
//! wait for in-flight requests to drain before bulk work starts.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::{setting_get, setting_set, DbState};
use crate::error::EngineError;
use crate::events::ChangeHub;
use crate::models::{EntityKind, ProductRecord, ProductRefreshOutcome};
use crate::remote::{ProductQuery, RemoteService};
use crate::request_tracker::RequestTracker;
use crate::store::ProductStore;

const SETTINGS_CATEGORY: &str = "products";

/// Options for a catalog refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    /// Bypass the freshness and cooldown guards.
    pub force: bool,
}

pub struct ProductSynchronizer {
    db: Arc<DbState>,
    store: Arc<ProductStore>,
    remote: Arc<dyn RemoteService>,
    tracker: Arc<RequestTracker>,
    config: Arc<SyncConfig>,
    hub: Arc<ChangeHub>,
    in_flight: Mutex<HashSet<String>>,
}

impl ProductSynchronizer {
    pub fn new(
        db: Arc<DbState>,
        store: Arc<ProductStore>,
        remote: Arc<dyn RemoteService>,
        tracker: Arc<RequestTracker>,
        config: Arc<SyncConfig>,
        hub: Arc<ChangeHub>,
    ) -> Self {
        Self {
            db,
            store,
            remote,
            tracker,
            config,
            hub,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Refresh the full catalog cache for a store.
    pub async fn sync_products(
        &self,
        store_id: &str,
        options: RefreshOptions,
    ) -> Result<ProductRefreshOutcome, EngineError> {
        let Some(_guard) = self.acquire_in_flight(store_id) else {
            debug!(store_id, "catalog refresh already in progress; skipping");
            return Ok(ProductRefreshOutcome::SkippedInProgress);
        };

        if !options.force {
            if self.cache_is_fresh(store_id)? {
                debug!(store_id, "catalog cache is fresh; skipping refresh");
                return Ok(ProductRefreshOutcome::SkippedFresh);
            }
            if self.within_cooldown(store_id) {
                debug!(store_id, "catalog refresh within cooldown window; skipping");
                return Ok(ProductRefreshOutcome::SkippedCooldown);
            }
        }

        // A bulk fetch against a half-drained request burst (token refresh,
        // sale submissions) can observe inconsistent state; wait it out,
        // bounded, and abandon on timeout.
        self.tracker
            .wait_until_idle(self.config.request_drain_timeout)
            .await?;

        let bulk = self
            .remote
            .get_products(store_id, ProductQuery::All)
            .await?;
        let bulk_complete = match bulk.total {
            Some(total) => bulk.items.len() as i64 >= total,
            None => false,
        };

        let (items, paged) = if bulk_complete {
            (bulk.items, false)
        } else {
            debug!(
                store_id,
                received = bulk.items.len(),
                total = bulk.total.unwrap_or(-1),
                "bulk catalog fetch incomplete or unverifiable; falling back to pages"
            );
            (self.fetch_paged(store_id, bulk.total).await?, true)
        };

        let mut fetched = 0usize;
        for item in &items {
            match ProductRecord::from_remote(item) {
                Some(product) => {
                    self.store.upsert(store_id, &product)?;
                    fetched += 1;
                }
                None => warn!(store_id, "skipping catalog entry without an id"),
            }
        }

        self.stamp_refresh(store_id);
        self.hub.publish(store_id, EntityKind::Product);
        info!(store_id, fetched, paged, "catalog cache refreshed");
        Ok(ProductRefreshOutcome::Refreshed { fetched, paged })
    }

    /// Narrow path after a quantity change: re-fetch only the affected
    /// products. Per-product remote failures are logged and skipped; the
    /// periodic refresh repairs them later.
    pub async fn sync_after_quantity_change(
        &self,
        store_id: &str,
        product_ids: &[String],
    ) -> Result<usize, EngineError> {
        let mut updated = 0usize;
        for product_id in product_ids {
            match self.remote.get_product(store_id, product_id).await {
                Ok(payload) => match ProductRecord::from_remote(&payload) {
                    Some(product) => {
                        self.store.upsert(store_id, &product)?;
                        updated += 1;
                    }
                    None => warn!(store_id, product_id, "remote product payload missing id"),
                },
                Err(e) => {
                    warn!(store_id, product_id, error = %e, "targeted product refresh failed")
                }
            }
        }
        if updated > 0 {
            self.hub.publish(store_id, EntityKind::Product);
        }
        Ok(updated)
    }

    /// Narrow path after a local create/update: upsert the single record.
    pub fn sync_after_create_or_update(
        &self,
        store_id: &str,
        product: &ProductRecord,
    ) -> Result<(), EngineError> {
        self.store.upsert(store_id, product)?;
        self.hub.publish(store_id, EntityKind::Product);
        Ok(())
    }

    async fn fetch_paged(
        &self,
        store_id: &str,
        total: Option<i64>,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        let per_page = self.config.product_page_size;
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let batch = self.fetch_page_with_retries(store_id, page, per_page).await?;
            let received = batch.len();
            items.extend(batch);

            if received < per_page as usize {
                break;
            }
            if let Some(total) = total {
                if items.len() as i64 >= total {
                    break;
                }
            }
            page += 1;
        }

        Ok(items)
    }

    async fn fetch_page_with_retries(
        &self,
        store_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        let mut last_error: Option<EngineError> = None;
        for attempt in 1..=self.config.product_page_retries.max(1) {
            match self
                .remote
                .get_products(store_id, ProductQuery::Page { page, per_page })
                .await
            {
                Ok(batch) => return Ok(batch.items),
                Err(e) => {
                    warn!(store_id, page, attempt, error = %e, "catalog page fetch failed");
                    last_error = Some(e.into());
                }
            }
        }
        Err(last_error.unwrap_or(EngineError::RequestDrainTimeout))
    }

    fn acquire_in_flight(&self, store_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = match self.in_flight.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(store_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            store_id: store_id.to_string(),
        })
    }

    fn cache_is_fresh(&self, store_id: &str) -> Result<bool, EngineError> {
        if self.config.product_freshness.is_zero() {
            return Ok(false);
        }
        let newest = self.store.newest_update(store_id)?;
        Ok(match newest {
            Some(ts) => {
                Utc::now().signed_duration_since(ts).to_std().unwrap_or_default()
                    < self.config.product_freshness
            }
            None => false,
        })
    }

    fn within_cooldown(&self, store_id: &str) -> bool {
        if self.config.product_refresh_cooldown.is_zero() {
            return false;
        }
        let key = format!("last_refresh:{store_id}");
        let Some(raw) = setting_get(&self.db, SETTINGS_CATEGORY, &key) else {
            return false;
        };
        let Ok(stamp) = DateTime::parse_from_rfc3339(&raw) else {
            return false;
        };
        Utc::now()
            .signed_duration_since(stamp.with_timezone(&Utc))
            .to_std()
            .unwrap_or_default()
            < self.config.product_refresh_cooldown
    }

    fn stamp_refresh(&self, store_id: &str) {
        let key = format!("last_refresh:{store_id}");
        if let Err(e) = setting_set(
            &self.db,
            SETTINGS_CATEGORY,
            &key,
            &Utc::now().to_rfc3339(),
        ) {
            debug!(store_id, error = %e, "failed to persist refresh stamp");
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    store_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.store_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockRemote;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        sync: Arc<ProductSynchronizer>,
        store: Arc<ProductStore>,
        remote: Arc<MockRemote>,
        tracker: Arc<RequestTracker>,
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let db = Arc::new(DbState::in_memory().expect("in-memory db"));
        let store = Arc::new(ProductStore::new(Arc::clone(&db)));
        let remote = Arc::new(MockRemote::new());
        let tracker = RequestTracker::new();
        let sync = Arc::new(ProductSynchronizer::new(
            db,
            Arc::clone(&store),
            remote.clone(),
            Arc::clone(&tracker),
            Arc::new(config),
            Arc::new(ChangeHub::default()),
        ));
        Fixture {
            sync,
            store,
            remote,
            tracker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig {
            product_freshness: Duration::ZERO,
            product_refresh_cooldown: Duration::ZERO,
            product_page_size: 2,
            request_drain_timeout: Duration::from_millis(200),
            ..SyncConfig::default()
        })
    }

    fn seed_remote(remote: &MockRemote, count: usize) {
        for i in 1..=count {
            remote.set_product(
                &format!("p{i}"),
                json!({ "id": format!("p{i}"), "name": format!("Product {i}"), "stock": i }),
            );
        }
    }

    #[tokio::test]
    async fn test_bulk_refresh_populates_cache() {
        let f = fixture();
        seed_remote(&f.remote, 3);

        let outcome = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("refresh");
        assert_eq!(
            outcome,
            ProductRefreshOutcome::Refreshed {
                fetched: 3,
                paged: false
            }
        );
        assert_eq!(f.store.count("s1").unwrap(), 3);
        assert!(f.remote.page_requests().is_empty(), "bulk fetch sufficed");
    }

    #[tokio::test]
    async fn test_incomplete_bulk_falls_back_to_pages() {
        let f = fixture();
        seed_remote(&f.remote, 5);
        // Bulk returns only 2 of 5; the reported total exposes the gap.
        f.remote.set_all_items_limit(2);

        let outcome = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("refresh");
        assert_eq!(
            outcome,
            ProductRefreshOutcome::Refreshed {
                fetched: 5,
                paged: true
            }
        );
        assert_eq!(f.store.count("s1").unwrap(), 5);
        assert_eq!(f.remote.page_requests(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_page_failure_is_retried() {
        let f = fixture();
        seed_remote(&f.remote, 5);
        f.remote.set_all_items_limit(2);
        f.remote.fail_page_once(2);

        let outcome = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("refresh");
        assert!(matches!(
            outcome,
            ProductRefreshOutcome::Refreshed { fetched: 5, .. }
        ));

        let pages = f.remote.page_requests();
        assert_eq!(
            pages.iter().filter(|p| **p == 2).count(),
            2,
            "page 2 fetched twice"
        );
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_refresh_unless_forced() {
        let f = fixture_with(SyncConfig {
            product_freshness: Duration::from_secs(300),
            product_refresh_cooldown: Duration::ZERO,
            ..SyncConfig::default()
        });
        seed_remote(&f.remote, 1);

        // Prime the cache; its last_updated_at is now.
        f.sync
            .sync_products("s1", RefreshOptions { force: true })
            .await
            .expect("primed");

        let skipped = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("checked");
        assert_eq!(skipped, ProductRefreshOutcome::SkippedFresh);

        let forced = f
            .sync
            .sync_products("s1", RefreshOptions { force: true })
            .await
            .expect("forced");
        assert!(matches!(forced, ProductRefreshOutcome::Refreshed { .. }));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_back_to_back_refreshes() {
        let f = fixture_with(SyncConfig {
            product_freshness: Duration::ZERO,
            product_refresh_cooldown: Duration::from_secs(300),
            ..SyncConfig::default()
        });
        seed_remote(&f.remote, 1);

        f.sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("first refresh runs");

        let second = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("second checked");
        assert_eq!(second, ProductRefreshOutcome::SkippedCooldown);
    }

    #[tokio::test]
    async fn test_refresh_abandons_when_requests_do_not_drain() {
        let f = fixture_with(SyncConfig {
            product_freshness: Duration::ZERO,
            product_refresh_cooldown: Duration::ZERO,
            request_drain_timeout: Duration::from_millis(30),
            ..SyncConfig::default()
        });
        seed_remote(&f.remote, 1);

        let _held = f.tracker.begin();
        let result = f.sync.sync_products("s1", RefreshOptions::default()).await;
        assert!(matches!(result, Err(EngineError::RequestDrainTimeout)));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_skipped() {
        let f = fixture_with(SyncConfig {
            product_freshness: Duration::ZERO,
            product_refresh_cooldown: Duration::ZERO,
            request_drain_timeout: Duration::from_secs(1),
            ..SyncConfig::default()
        });
        seed_remote(&f.remote, 1);

        // Hold the tracker so the first refresh parks in the drain wait
        // while owning the in-flight slot.
        let held = f.tracker.begin();
        let first = {
            let sync = Arc::clone(&f.sync);
            tokio::spawn(async move { sync.sync_products("s1", RefreshOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = f
            .sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("checked");
        assert_eq!(second, ProductRefreshOutcome::SkippedInProgress);

        drop(held);
        let first = first.await.expect("join").expect("first refresh finishes");
        assert!(matches!(first, ProductRefreshOutcome::Refreshed { .. }));
    }

    #[tokio::test]
    async fn test_refresh_preserves_unrelated_local_fields() {
        let f = fixture();
        // A record the backend does not return, carrying a local-only id.
        f.store
            .upsert(
                "s1",
                &ProductRecord {
                    id: "local-only".to_string(),
                    name: "Local Draft".to_string(),
                    barcode: None,
                    price: 1.0,
                    stock: 3.0,
                    category_id: None,
                    brand_id: None,
                    unit_id: None,
                    backend_id: Some("kept".to_string()),
                },
            )
            .unwrap();
        seed_remote(&f.remote, 2);

        f.sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("refresh");

        let untouched = f.store.get("s1", "local-only").unwrap().unwrap();
        assert_eq!(untouched.backend_id.as_deref(), Some("kept"));
        assert_eq!(f.store.count("s1").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_targeted_refresh_updates_only_listed_products() {
        let f = fixture();
        seed_remote(&f.remote, 2);
        f.sync
            .sync_products("s1", RefreshOptions::default())
            .await
            .expect("primed");

        f.remote
            .set_product("p1", json!({ "id": "p1", "name": "Product 1", "stock": 99 }));

        let updated = f
            .sync
            .sync_after_quantity_change("s1", &["p1".to_string(), "missing".to_string()])
            .await
            .expect("targeted refresh");
        assert_eq!(updated, 1, "missing product is skipped, not fatal");

        let p1 = f.store.get("s1", "p1").unwrap().unwrap();
        assert!((p1.stock - 99.0).abs() < f64::EPSILON);
    }
}
