//! Inventory synchronizer.
//!
//! Local stock mutations are queued as [`StockChangeRecord`]s instead of
//! hitting the backend immediately. At sync time the pending changes for a
//! product are merged into one effective delta and replayed on top of the
//! stock the backend actually has, never overwriting it with an absolute
//! value computed against a stale baseline. A sale that reduced stock by N
//! keeps reducing it by N even when a concurrent writer moved the baseline.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, StoreError};
use crate::events::ChangeHub;
use crate::json::num_any;
use crate::models::{EntityKind, InventorySyncReport, StockChangeRecord, StockOperation};
use crate::remote::RemoteService;
use crate::store::{ProductStore, StockChangeStore};

pub struct InventorySynchronizer {
    changes: Arc<StockChangeStore>,
    products: Arc<ProductStore>,
    remote: Arc<dyn RemoteService>,
    hub: Arc<ChangeHub>,
}

impl InventorySynchronizer {
    pub fn new(
        changes: Arc<StockChangeStore>,
        products: Arc<ProductStore>,
        remote: Arc<dyn RemoteService>,
        hub: Arc<ChangeHub>,
    ) -> Self {
        Self {
            changes,
            products,
            remote,
            hub,
        }
    }

    /// Record a local stock mutation and apply it to the cached product.
    /// The backend is not called here; the change waits for the next drain.
    pub fn record_stock_change(
        &self,
        store_id: &str,
        product_id: &str,
        old_stock: f64,
        new_stock: f64,
        operation: StockOperation,
    ) -> Result<StockChangeRecord, StoreError> {
        let record = StockChangeRecord::new(store_id, product_id, old_stock, new_stock, operation);
        self.changes.insert(&record)?;
        self.products.set_stock(store_id, product_id, new_stock)?;
        self.hub.publish(store_id, EntityKind::StockChange);
        debug!(
            store_id,
            product_id,
            change = record.change,
            operation = operation.as_str(),
            "stock change queued"
        );
        Ok(record)
    }

    /// Drain pending stock changes: group by product, sum deltas, replay on
    /// the backend's current stock, write the adjusted value back both ways.
    pub async fn sync_unsynced_changes(
        &self,
        store_id: &str,
    ) -> Result<InventorySyncReport, EngineError> {
        let pending = match self.changes.unsynced(store_id) {
            Ok(pending) => pending,
            Err(StoreError::Unavailable) => {
                debug!(store_id, "local store unavailable; nothing to drain");
                return Ok(InventorySyncReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        // BTreeMap keeps the drain order deterministic across runs.
        let mut by_product: BTreeMap<String, Vec<StockChangeRecord>> = BTreeMap::new();
        for change in pending {
            by_product
                .entry(change.product_id.clone())
                .or_default()
                .push(change);
        }

        let mut report = InventorySyncReport {
            products_considered: by_product.len(),
            ..InventorySyncReport::default()
        };

        for (product_id, group) in by_product {
            let delta: f64 = group.iter().map(|c| c.change).sum();
            // Changes are oldest-first, so the first one carries the stock
            // level the whole group was computed against.
            let expected = group[0].old_stock;
            let ids: Vec<String> = group.iter().map(|c| c.id.clone()).collect();

            match self.push_product_delta(store_id, &product_id, expected, delta).await {
                Ok(adjusted) => {
                    if let Err(e) = self.products.set_stock(store_id, &product_id, adjusted) {
                        warn!(product_id, error = %e, "failed to update cached stock");
                    }
                    match self.changes.mark_synced(store_id, &ids) {
                        Ok(n) => report.changes_synced += n,
                        Err(e) => warn!(product_id, error = %e, "failed to flag changes synced"),
                    }
                    report.products_synced += 1;
                }
                Err(e) => {
                    report.products_failed += 1;
                    report.errors.push(format!("{product_id}: {e}"));
                    if let Err(bump_err) = self.changes.bump_retry(store_id, &ids) {
                        warn!(product_id, error = %bump_err, "failed to bump retry count");
                    }
                }
            }
        }

        if report.products_considered > 0 {
            info!(
                store_id,
                products = report.products_considered,
                synced = report.products_synced,
                failed = report.products_failed,
                "stock changes drained"
            );
            self.hub.publish(store_id, EntityKind::Product);
        }
        Ok(report)
    }

    /// Replay one merged delta on the backend's actual stock and return the
    /// adjusted absolute value that was written.
    async fn push_product_delta(
        &self,
        store_id: &str,
        product_id: &str,
        expected: f64,
        delta: f64,
    ) -> Result<f64, EngineError> {
        let remote_product = self.remote.get_product(store_id, product_id).await?;
        let remote_stock =
            num_any(&remote_product, &["stock", "quantity", "stockQuantity"]).unwrap_or(0.0);

        if (remote_stock - expected).abs() > f64::EPSILON {
            // A concurrent writer moved the baseline; replaying the delta
            // preserves both intents.
            info!(
                store_id,
                product_id,
                expected,
                remote = remote_stock,
                delta,
                "remote stock diverged from expected baseline; replaying delta"
            );
        }

        let adjusted = (remote_stock + delta).max(0.0);
        self.remote
            .update_product(store_id, product_id, &json!({ "stock": adjusted }))
            .await?;
        Ok(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbState;
    use crate::error::RemoteError;
    use crate::models::ProductRecord;
    use crate::remote::mock::MockRemote;

    struct Fixture {
        sync: InventorySynchronizer,
        changes: Arc<StockChangeStore>,
        products: Arc<ProductStore>,
        remote: Arc<MockRemote>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(DbState::in_memory().expect("in-memory db"));
        let changes = Arc::new(StockChangeStore::new(Arc::clone(&db)));
        let products = Arc::new(ProductStore::new(db));
        let remote = Arc::new(MockRemote::new());
        let sync = InventorySynchronizer::new(
            Arc::clone(&changes),
            Arc::clone(&products),
            remote.clone(),
            Arc::new(ChangeHub::default()),
        );
        Fixture {
            sync,
            changes,
            products,
            remote,
        }
    }

    fn cached_product(f: &Fixture, id: &str, stock: f64) {
        f.products
            .upsert(
                "s1",
                &ProductRecord {
                    id: id.to_string(),
                    name: format!("Product {id}"),
                    barcode: None,
                    price: 1.0,
                    stock,
                    category_id: None,
                    brand_id: None,
                    unit_id: None,
                    backend_id: None,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_updates_cache_without_remote_call() {
        let f = fixture();
        cached_product(&f, "p1", 10.0);

        f.sync
            .record_stock_change("s1", "p1", 10.0, 7.0, StockOperation::Sale)
            .unwrap();

        let local = f.products.get("s1", "p1").unwrap().unwrap();
        assert!((local.stock - 7.0).abs() < f64::EPSILON);
        assert_eq!(f.changes.count_unsynced("s1").unwrap(), 1);
        assert!(f.remote.update_calls_for("p1").is_empty());
    }

    #[tokio::test]
    async fn test_changes_for_one_product_merge_into_single_delta() {
        let f = fixture();
        cached_product(&f, "p1", 10.0);
        f.remote.set_product("p1", serde_json::json!({ "id": "p1", "stock": 10.0 }));

        // −3 then −2 in the same session, both unsynced.
        f.sync
            .record_stock_change("s1", "p1", 10.0, 7.0, StockOperation::Sale)
            .unwrap();
        f.sync
            .record_stock_change("s1", "p1", 7.0, 5.0, StockOperation::Sale)
            .unwrap();

        let report = f.sync.sync_unsynced_changes("s1").await.expect("report");
        assert_eq!(report.products_considered, 1);
        assert_eq!(report.products_synced, 1);
        assert_eq!(report.changes_synced, 2);

        let updates = f.remote.update_calls_for("p1");
        assert_eq!(updates.len(), 1, "one merged write, not one per change");
        assert_eq!(num_any(&updates[0], &["stock"]), Some(5.0));
        assert_eq!(f.changes.count_unsynced("s1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delta_replays_on_moved_remote_baseline() {
        let f = fixture();
        cached_product(&f, "p1", 10.0);
        // Local expectation: stock was 10 before a −3 sale. Meanwhile another
        // terminal restocked to 20.
        f.remote.set_product("p1", serde_json::json!({ "id": "p1", "stock": 20.0 }));

        f.sync
            .record_stock_change("s1", "p1", 10.0, 7.0, StockOperation::Sale)
            .unwrap();

        f.sync.sync_unsynced_changes("s1").await.expect("report");

        // max(0, R + D) = 20 − 3 = 17: not E+D (7), not R unchanged (20).
        assert_eq!(f.remote.remote_stock("p1"), Some(17.0));
        let local = f.products.get("s1", "p1").unwrap().unwrap();
        assert!((local.stock - 17.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_adjusted_stock_never_goes_negative() {
        let f = fixture();
        cached_product(&f, "p1", 4.0);
        f.remote.set_product("p1", serde_json::json!({ "id": "p1", "stock": 1.0 }));

        f.sync
            .record_stock_change("s1", "p1", 4.0, 0.0, StockOperation::Sale)
            .unwrap();

        f.sync.sync_unsynced_changes("s1").await.expect("report");
        assert_eq!(f.remote.remote_stock("p1"), Some(0.0), "floored at zero");
    }

    #[tokio::test]
    async fn test_failed_push_bumps_retry_and_keeps_changes() {
        let f = fixture();
        cached_product(&f, "p1", 10.0);
        f.remote.set_product("p1", serde_json::json!({ "id": "p1", "stock": 10.0 }));
        f.remote
            .push_update_error(RemoteError::new(503, "POS backend server error"));

        f.sync
            .record_stock_change("s1", "p1", 10.0, 7.0, StockOperation::Sale)
            .unwrap();

        let report = f.sync.sync_unsynced_changes("s1").await.expect("report");
        assert_eq!(report.products_failed, 1);
        assert_eq!(report.errors.len(), 1);

        let still_pending = f.changes.unsynced("s1").unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_products_drain_independently() {
        let f = fixture();
        cached_product(&f, "p1", 10.0);
        cached_product(&f, "p2", 5.0);
        f.remote.set_product("p1", serde_json::json!({ "id": "p1", "stock": 10.0 }));
        // p2 is missing remotely: its fetch 404s, but p1 still syncs.

        f.sync
            .record_stock_change("s1", "p1", 10.0, 9.0, StockOperation::Sale)
            .unwrap();
        f.sync
            .record_stock_change("s1", "p2", 5.0, 4.0, StockOperation::Sale)
            .unwrap();

        let report = f.sync.sync_unsynced_changes("s1").await.expect("report");
        assert_eq!(report.products_considered, 2);
        assert_eq!(report.products_synced, 1);
        assert_eq!(report.products_failed, 1);
        assert_eq!(f.remote.remote_stock("p1"), Some(9.0));
    }
}
