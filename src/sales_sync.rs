//! Sales synchronizer.
//!
//! Pushes locally persisted sales to the backend and reconciles the
//! outcome. The interesting path is the duplicate-invoice rejection: a 409
//! may mean a previous attempt actually succeeded but the acknowledgment was
//! lost, so the synchronizer first looks for the sale on the backend and
//! adopts it (idempotent recovery) before recording a retryable error.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{EngineError, RemoteError, StoreError};
use crate::events::ChangeHub;
use crate::json::{str_any, strip_keys};
use crate::models::{
    EntityKind, SaleOutcome, SaleRecord, SaleSyncFailure, SalesSyncReport,
};
use crate::remote::{RemoteService, SalesFilter};
use crate::store::SaleStore;

/// Keys that exist only for local bookkeeping and must not reach the wire.
const LOCAL_ONLY_KEYS: &[&str] = &["synced", "syncError", "backendId"];

pub struct SalesSynchronizer {
    store: Arc<SaleStore>,
    remote: Arc<dyn RemoteService>,
    config: Arc<SyncConfig>,
    changes: Arc<ChangeHub>,
}

impl SalesSynchronizer {
    pub fn new(
        store: Arc<SaleStore>,
        remote: Arc<dyn RemoteService>,
        config: Arc<SyncConfig>,
        changes: Arc<ChangeHub>,
    ) -> Self {
        Self {
            store,
            remote,
            config,
            changes,
        }
    }

    /// Submit one sale. Business rejections come back as
    /// `SaleOutcome { success: false, .. }`; `Err` is reserved for programmer
    /// errors (missing store id, unserializable payload).
    pub async fn sync_sale(&self, sale: &SaleRecord) -> Result<SaleOutcome, EngineError> {
        if sale.store_id.trim().is_empty() {
            return Err(StoreError::MissingStoreId.into());
        }

        let wire = wire_payload(sale)?;
        match self.remote.create_sale(&sale.store_id, &wire).await {
            Ok(resp) => {
                let backend_id = str_any(
                    &resp,
                    &["id", "backendId", "backend_id", "saleId", "sale_id"],
                );
                info!(
                    sale_id = %sale.id,
                    invoice_number = %sale.invoice_number,
                    backend_id = backend_id.as_deref().unwrap_or("-"),
                    "sale synced"
                );
                self.mark_synced_local(sale, backend_id.as_deref());
                Ok(SaleOutcome::confirmed(backend_id))
            }
            Err(err) if err.is_conflict() => self.recover_from_conflict(sale, &err).await,
            Err(err) => {
                warn!(
                    sale_id = %sale.id,
                    invoice_number = %sale.invoice_number,
                    error = %err,
                    "sale sync failed; will retry"
                );
                self.record_error_local(sale, &err.message);
                Ok(SaleOutcome::failed(err.message))
            }
        }
    }

    /// The backend rejected the invoice number as a duplicate. If the sale is
    /// already there, a previous attempt succeeded and only the ack was lost:
    /// adopt the remote copy. Otherwise the true state is unknown, so record
    /// a retryable error rather than a terminal failure.
    async fn recover_from_conflict(
        &self,
        sale: &SaleRecord,
        conflict: &RemoteError,
    ) -> Result<SaleOutcome, EngineError> {
        let filter = SalesFilter {
            invoice_number: Some(sale.invoice_number.clone()),
            since: None,
        };

        match self.remote.get_sales(&sale.store_id, &filter).await {
            Ok(remote_sales) => {
                let matching = remote_sales.iter().find(|s| {
                    str_any(s, &["invoiceNumber", "invoice_number"]).as_deref()
                        == Some(sale.invoice_number.as_str())
                });

                if let Some(found) = matching {
                    let backend_id = str_any(found, &["id", "backendId", "backend_id"]);
                    info!(
                        sale_id = %sale.id,
                        invoice_number = %sale.invoice_number,
                        backend_id = backend_id.as_deref().unwrap_or("-"),
                        "duplicate-invoice conflict resolved: sale already on backend"
                    );
                    self.mark_synced_local(sale, backend_id.as_deref());
                    Ok(SaleOutcome::confirmed(backend_id))
                } else {
                    let message = format!(
                        "Invoice {} was rejected as a duplicate but no matching remote sale was found; will retry",
                        sale.invoice_number
                    );
                    warn!(sale_id = %sale.id, "{message}");
                    self.record_error_local(sale, &message);
                    Ok(SaleOutcome::failed(message))
                }
            }
            Err(lookup_err) => {
                let message = format!(
                    "Duplicate-invoice recovery lookup failed ({lookup_err}); original rejection: {conflict}"
                );
                warn!(sale_id = %sale.id, "{message}");
                self.record_error_local(sale, &message);
                Ok(SaleOutcome::failed(message))
            }
        }
    }

    /// Drain every unsynced sale for a store, oldest first, with a pacing
    /// delay between submissions.
    pub async fn sync_unsynced_sales(&self, store_id: &str) -> Result<SalesSyncReport, EngineError> {
        let pending = match self.store.unsynced(store_id) {
            Ok(pending) => pending,
            Err(StoreError::Unavailable) => {
                debug!(store_id, "local store unavailable; nothing to drain");
                return Ok(SalesSyncReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = SalesSyncReport {
            attempted: pending.len(),
            ..SalesSyncReport::default()
        };

        for (i, sale) in pending.iter().enumerate() {
            if i > 0 && !self.config.sale_sync_pacing.is_zero() {
                tokio::time::sleep(self.config.sale_sync_pacing).await;
            }

            match self.sync_sale(sale).await {
                Ok(outcome) if outcome.success => report.synced += 1,
                Ok(outcome) => {
                    report.failed += 1;
                    report.errors.push(SaleSyncFailure {
                        sale_id: sale.id.clone(),
                        invoice_number: sale.invoice_number.clone(),
                        error: outcome.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(SaleSyncFailure {
                        sale_id: sale.id.clone(),
                        invoice_number: sale.invoice_number.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.attempted > 0 {
            info!(
                store_id,
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                "unsynced sales drained"
            );
        }
        Ok(report)
    }

    /// Local bookkeeping failures must not undo a remote success; they are
    /// logged and the outcome stands.
    fn mark_synced_local(&self, sale: &SaleRecord, backend_id: Option<&str>) {
        if let Err(e) = self.store.mark_synced(&sale.store_id, &sale.id, backend_id) {
            warn!(sale_id = %sale.id, error = %e, "failed to record sync success locally");
        }
        self.changes.publish(&sale.store_id, EntityKind::Sale);
    }

    fn record_error_local(&self, sale: &SaleRecord, message: &str) {
        if let Err(e) = self.store.record_sync_error(&sale.store_id, &sale.id, message) {
            warn!(sale_id = %sale.id, error = %e, "failed to record sync error locally");
        }
        self.changes.publish(&sale.store_id, EntityKind::Sale);
    }
}

/// Serialize a sale for the wire, without local bookkeeping fields.
fn wire_payload(sale: &SaleRecord) -> Result<Value, EngineError> {
    let full = serde_json::to_value(sale).map_err(StoreError::serialize("serialize sale"))?;
    Ok(strip_keys(&full, LOCAL_ONLY_KEYS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbState;
    use crate::models::SaleDraft;
    use crate::remote::mock::MockRemote;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        sync: SalesSynchronizer,
        store: Arc<SaleStore>,
        remote: Arc<MockRemote>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(DbState::in_memory().expect("in-memory db"));
        let store = Arc::new(SaleStore::new(db));
        let remote = Arc::new(MockRemote::new());
        let config = Arc::new(SyncConfig {
            sale_sync_pacing: Duration::from_millis(0),
            ..SyncConfig::default()
        });
        let sync = SalesSynchronizer::new(
            Arc::clone(&store),
            remote.clone(),
            config,
            Arc::new(ChangeHub::default()),
        );
        Fixture {
            sync,
            store,
            remote,
        }
    }

    fn sale(store_id: &str, invoice: &str) -> SaleRecord {
        SaleRecord::from_draft(
            store_id,
            invoice,
            SaleDraft {
                subtotal: 10.0,
                total: 10.0,
                paid: 10.0,
                ..SaleDraft::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_sync_marks_local_record() {
        let f = fixture();
        let s = sale("s1", "INV-1");
        f.store.upsert(&s).unwrap();

        let outcome = f.sync.sync_sale(&s).await.expect("no infrastructure fault");
        assert!(outcome.success);
        assert_eq!(outcome.backend_id.as_deref(), Some("r-1"));

        let local = f.store.get("s1", &s.id).unwrap().unwrap();
        assert!(local.synced);
        assert_eq!(local.backend_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_missing_store_id_fails_fast() {
        let f = fixture();
        let mut s = sale("s1", "INV-1");
        s.store_id = String::new();

        let result = f.sync.sync_sale(&s).await;
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::MissingStoreId))
        ));
        assert_eq!(f.remote.create_calls(), 0, "nothing reaches the wire");
    }

    #[tokio::test]
    async fn test_wire_payload_strips_local_fields() {
        let mut s = sale("s1", "INV-1");
        s.sync_error = Some("old error".to_string());
        s.backend_id = Some("stale".to_string());

        let wire = wire_payload(&s).expect("serializes");
        assert!(wire.get("synced").is_none());
        assert!(wire.get("syncError").is_none());
        assert!(wire.get("backendId").is_none());
        assert_eq!(wire["invoiceNumber"], "INV-1");
        assert_eq!(wire["storeId"], "s1");
    }

    #[tokio::test]
    async fn test_conflict_with_matching_remote_sale_recovers_idempotently() {
        let f = fixture();
        let s = sale("s1", "INV-9");
        f.store.upsert(&s).unwrap();

        f.remote
            .push_create_result(Err(RemoteError::new(409, "Duplicate invoice number")));
        f.remote.add_remote_sale(json!({
            "id": "abc123",
            "storeId": "s1",
            "invoiceNumber": "INV-9"
        }));

        let outcome = f.sync.sync_sale(&s).await.expect("recovered");
        assert!(outcome.success);
        assert_eq!(outcome.backend_id.as_deref(), Some("abc123"));

        let local = f.store.get("s1", &s.id).unwrap().unwrap();
        assert!(local.synced);
        assert_eq!(local.backend_id.as_deref(), Some("abc123"));
        assert_eq!(f.remote.created_count(), 0, "no duplicate was created");
    }

    #[tokio::test]
    async fn test_inconclusive_conflict_downgrades_to_retryable() {
        let f = fixture();
        let s = sale("s1", "INV-9");
        f.store.upsert(&s).unwrap();

        f.remote
            .push_create_result(Err(RemoteError::new(409, "Duplicate invoice number")));
        // No matching remote sale exists.

        let outcome = f.sync.sync_sale(&s).await.expect("handled");
        assert!(!outcome.success);

        let local = f.store.get("s1", &s.id).unwrap().unwrap();
        assert!(!local.synced, "left unsynced for the periodic retry");
        assert!(local.sync_error.is_some());
    }

    #[tokio::test]
    async fn test_server_error_is_recorded_as_retryable() {
        let f = fixture();
        let s = sale("s1", "INV-2");
        f.store.upsert(&s).unwrap();

        f.remote
            .push_create_result(Err(RemoteError::new(503, "POS backend server error")));

        let outcome = f.sync.sync_sale(&s).await.expect("handled");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("server error"));

        let local = f.store.get("s1", &s.id).unwrap().unwrap();
        assert!(!local.synced);
        assert!(local.sync_error.unwrap().contains("server error"));
    }

    #[tokio::test]
    async fn test_resubmitting_after_lost_ack_converges_on_one_remote_sale() {
        let f = fixture();
        let s = sale("s1", "INV-4");
        f.store.upsert(&s).unwrap();

        // First attempt succeeds remotely...
        let first = f.sync.sync_sale(&s).await.expect("first attempt");
        assert!(first.success);
        // ...but the acknowledgment is lost before the flag is persisted.
        f.store
            .record_sync_error("s1", &s.id, "connection dropped mid-response")
            .unwrap();

        // The retry gets a 409 from the backend's uniqueness check and
        // recovers by adopting the committed sale.
        let second = f.sync.sync_sale(&s).await.expect("second attempt");
        assert!(second.success);
        assert_eq!(second.backend_id, first.backend_id);

        assert_eq!(f.remote.created_count(), 1, "exactly one remote sale");
        let local = f.store.get("s1", &s.id).unwrap().unwrap();
        assert!(local.synced);
        assert_eq!(local.backend_id, first.backend_id);
    }

    #[tokio::test]
    async fn test_batch_drain_is_oldest_first_and_counts_failures() {
        let f = fixture();
        let older = sale("s1", "INV-1");
        let newer = sale("s1", "INV-2");
        f.store.upsert(&older).unwrap();
        f.store.upsert(&newer).unwrap();

        // First submission (the older sale) succeeds, the second fails.
        f.remote
            .push_create_result(Ok(json!({ "id": "r-ok", "success": true })));
        f.remote
            .push_create_result(Err(RemoteError::new(503, "POS backend server error")));

        let report = f.sync.sync_unsynced_sales("s1").await.expect("report");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].invoice_number, "INV-2");

        let older_local = f.store.get("s1", &older.id).unwrap().unwrap();
        assert!(older_local.synced, "older sale drained first");
    }

    #[tokio::test]
    async fn test_drain_with_unavailable_store_reports_empty() {
        let store = Arc::new(SaleStore::new(Arc::new(DbState::network_only())));
        let sync = SalesSynchronizer::new(
            store,
            Arc::new(MockRemote::new()),
            Arc::new(SyncConfig::default()),
            Arc::new(ChangeHub::default()),
        );

        let report = sync.sync_unsynced_sales("s1").await.expect("report");
        assert_eq!(report.attempted, 0);
    }
}
