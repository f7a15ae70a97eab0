//! Engine facade.
//!
//! Wires the stores, queues, and synchronizers into one explicitly
//! constructed object graph with no globals, so tests and multi-store
//! sessions can hold isolated instances. The UI talks to [`SyncEngine`]; background
//! scheduling lives in the `scheduler` module.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::db::DbState;
use crate::error::{EngineError, StoreError};
use crate::events::{ChangeEvent, ChangeHub};
use crate::inventory_sync::InventorySynchronizer;
use crate::invoice::InvoiceSequencer;
use crate::models::{
    EntityKind, LogoutReport, SaleDraft, SaleOutcome, SaleRecord, StockOperation,
    SyncCycleReport, SyncStatusSnapshot,
};
use crate::product_sync::{ProductSynchronizer, RefreshOptions};
use crate::remote::RemoteService;
use crate::request_tracker::{RequestTracker, TrackedRemote};
use crate::sale_queue::SaleQueue;
use crate::sales_sync::SalesSynchronizer;
use crate::store::{DocStore, ProductStore, SaleStore, StockChangeStore, SyncQueueLog};
use crate::task_queue::TaskQueue;

/// The assembled sync engine for one local replica.
pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteService>,
    config: Arc<SyncConfig>,
    tracker: Arc<RequestTracker>,
    tasks: TaskQueue,
    changes: Arc<ChangeHub>,

    pub sales_store: Arc<SaleStore>,
    pub product_store: Arc<ProductStore>,
    pub stock_store: Arc<StockChangeStore>,
    pub customers: DocStore<Value>,
    pub categories: DocStore<Value>,
    pub brands: DocStore<Value>,
    pub units: DocStore<Value>,
    pub sync_log: SyncQueueLog,

    pub sales: Arc<SalesSynchronizer>,
    pub inventory: Arc<InventorySynchronizer>,
    pub products: Arc<ProductSynchronizer>,
    pub invoices: Arc<InvoiceSequencer>,

    sale_queue: SaleQueue,
    last_sync: Mutex<Option<String>>,
}

impl SyncEngine {
    /// Build the object graph. All remote traffic is routed through the
    /// request tracker so bulk refreshes can wait for it to drain.
    ///
    /// Must be called from within a tokio runtime: the sale lifecycle
    /// queue spawns its worker here.
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let tracker = RequestTracker::new();
        let remote: Arc<dyn RemoteService> =
            Arc::new(TrackedRemote::new(remote, Arc::clone(&tracker)));
        let changes = Arc::new(ChangeHub::default());

        let sales_store = Arc::new(SaleStore::new(Arc::clone(&db)));
        let product_store = Arc::new(ProductStore::new(Arc::clone(&db)));
        let stock_store = Arc::new(StockChangeStore::new(Arc::clone(&db)));
        let customers = DocStore::new(Arc::clone(&db), EntityKind::Customer);
        let categories = DocStore::new(Arc::clone(&db), EntityKind::Category);
        let brands = DocStore::new(Arc::clone(&db), EntityKind::Brand);
        let units = DocStore::new(Arc::clone(&db), EntityKind::Unit);
        let sync_log = SyncQueueLog::new(Arc::clone(&db));

        let sales = Arc::new(SalesSynchronizer::new(
            Arc::clone(&sales_store),
            Arc::clone(&remote),
            Arc::clone(&config),
            Arc::clone(&changes),
        ));
        let inventory = Arc::new(InventorySynchronizer::new(
            Arc::clone(&stock_store),
            Arc::clone(&product_store),
            Arc::clone(&remote),
            Arc::clone(&changes),
        ));
        let products = Arc::new(ProductSynchronizer::new(
            Arc::clone(&db),
            Arc::clone(&product_store),
            Arc::clone(&remote),
            Arc::clone(&tracker),
            Arc::clone(&config),
            Arc::clone(&changes),
        ));
        let invoices = Arc::new(InvoiceSequencer::new(
            Arc::clone(&sales_store),
            Arc::clone(&remote),
            Arc::clone(&config),
        ));
        let sale_queue = SaleQueue::new(Arc::clone(&sales_store), Arc::clone(&sales));

        if !db.is_available() {
            warn!("local store unavailable; engine running network-only");
        }

        Arc::new(Self {
            db,
            remote,
            config,
            tracker,
            tasks: TaskQueue::new(),
            changes,
            sales_store,
            product_store,
            stock_store,
            customers,
            categories,
            brands,
            units,
            sync_log,
            sales,
            inventory,
            products,
            invoices,
            sale_queue,
            last_sync: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Ring up a sale: assign the invoice number, run the FIFO lifecycle
    /// queue, return the definite outcome.
    pub async fn submit_sale(
        &self,
        store_id: &str,
        draft: SaleDraft,
    ) -> Result<SaleOutcome, EngineError> {
        if store_id.trim().is_empty() {
            return Err(EngineError::InvalidSale("missing store id".to_string()));
        }
        if draft.items.is_empty() {
            return Err(EngineError::InvalidSale("sale has no items".to_string()));
        }

        let invoice_number = self.invoices.next_invoice_number(store_id).await;
        let sale = SaleRecord::from_draft(store_id, &invoice_number, draft);

        // Stock moves optimistically at ring-up time; reconciliation with
        // the backend happens through the inventory synchronizer.
        for item in &sale.items {
            if let Ok(Some(product)) = self.product_store.get(store_id, &item.product_id) {
                let new_stock = (product.stock - item.quantity).max(0.0);
                if let Err(e) = self.inventory.record_stock_change(
                    store_id,
                    &item.product_id,
                    product.stock,
                    new_stock,
                    StockOperation::Sale,
                ) {
                    warn!(
                        product_id = %item.product_id,
                        error = %e,
                        "failed to queue stock change for sale item"
                    );
                }
            }
        }

        self.sale_queue.submit(sale).await
    }

    /// One full sync cycle, serialized through the unified task queue so the
    /// periodic timer, a connectivity-regained trigger, and a manual refresh
    /// cannot run concurrently against the same tables.
    pub async fn run_sync_cycle(&self, store_id: &str) -> Result<SyncCycleReport, EngineError> {
        let sales = Arc::clone(&self.sales);
        let inventory = Arc::clone(&self.inventory);
        let products = Arc::clone(&self.products);
        let store_id_owned = store_id.to_string();

        let rx = self.tasks.enqueue("sync-cycle", 0, async move {
            let sales_report = sales.sync_unsynced_sales(&store_id_owned).await?;
            let inventory_report = inventory.sync_unsynced_changes(&store_id_owned).await?;
            let (products_outcome, products_error) = match products
                .sync_products(&store_id_owned, RefreshOptions::default())
                .await
            {
                Ok(outcome) => (Some(outcome), None),
                Err(e) => {
                    warn!(store_id = %store_id_owned, error = %e, "catalog refresh failed in cycle");
                    (None, Some(e.to_string()))
                }
            };

            let report = SyncCycleReport {
                sales: sales_report,
                inventory: inventory_report,
                products: products_outcome,
                products_error,
            };
            serde_json::to_value(&report)
                .map_err(|e| StoreError::serialize("serialize cycle report")(e).into())
        });

        let value = rx.await.map_err(|_| EngineError::QueueClosed)??;
        let report: SyncCycleReport = serde_json::from_value(value)
            .map_err(|e| EngineError::Store(StoreError::serialize("parse cycle report")(e)))?;

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        Ok(report)
    }

    /// Queue-depth snapshot for status surfaces. Works in network-only mode
    /// (counts read as zero, availability flag goes false).
    pub fn sync_status(&self, store_id: &str) -> SyncStatusSnapshot {
        fn count_or_zero(result: Result<i64, StoreError>) -> i64 {
            result.unwrap_or(0)
        }

        SyncStatusSnapshot {
            unsynced_sales: count_or_zero(self.sales_store.count_unsynced(store_id)),
            sales_with_errors: count_or_zero(self.sales_store.count_with_errors(store_id)),
            pending_stock_changes: count_or_zero(self.stock_store.count_unsynced(store_id)),
            pending_fallback_entries: count_or_zero(self.sync_log.count(store_id)),
            tasks_queued: self.tasks.pending_len(),
            local_store_available: self.db.is_available(),
            last_sync: self.last_sync.lock().ok().and_then(|g| g.clone()),
        }
    }

    /// Logout contract: flush unsynced sales best-effort, then clear every
    /// per-store table. Each step proceeds even when a prior step partially
    /// failed; losing unflushed data on an offline logout is the operation's
    /// explicit semantics.
    pub async fn logout(&self, store_id: &str) -> LogoutReport {
        let mut report = LogoutReport::default();

        match self.sales.sync_unsynced_sales(store_id).await {
            Ok(flush) => {
                report.flushed_sales = flush.synced;
                report.flush_failures = flush.failed;
                if flush.failed > 0 {
                    warn!(
                        store_id,
                        failed = flush.failed,
                        "logout flush left sales behind; clearing anyway"
                    );
                }
            }
            Err(e) => {
                warn!(store_id, error = %e, "logout flush failed; clearing anyway");
                report.errors.push(format!("flush: {e}"));
            }
        }

        let mut cleared = true;
        let mut clear = |label: &str, result: Result<usize, StoreError>| match result {
            Ok(_) => {}
            Err(e) => {
                cleared = false;
                report.errors.push(format!("{label}: {e}"));
            }
        };
        clear("sales", self.sales_store.clear_for_store(store_id));
        clear("products", self.product_store.clear_for_store(store_id));
        clear("stock_changes", self.stock_store.clear_for_store(store_id));
        clear("customers", self.customers.clear_for_store(store_id));
        clear("categories", self.categories.clear_for_store(store_id));
        clear("brands", self.brands.clear_for_store(store_id));
        clear("units", self.units.clear_for_store(store_id));
        clear("sync_queue", self.sync_log.clear_for_store(store_id));
        report.cleared = cleared;

        info!(
            store_id,
            flushed = report.flushed_sales,
            cleared = report.cleared,
            "logout cleanup finished"
        );
        report
    }

    /// Full teardown: close the connection and delete the database files.
    /// Call after [`SyncEngine::logout`] when the replica should not
    /// survive.
    pub fn teardown(&self) {
        self.db.destroy();
    }
}
