//! Sale lifecycle queue.
//!
//! Strict-FIFO submission pipeline: each sale gets an ephemeral context with
//! an explicit state machine, is persisted unsynced, and is handed to the
//! sales synchronizer one at a time. The next sale is dequeued only after
//! the previous outcome is delivered, so invoice numbers are never raced and
//! the backend never sees two interleaved submissions for the same store.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{SaleContext, SaleOutcome, SaleRecord, SaleState};
use crate::sales_sync::SalesSynchronizer;
use crate::store::SaleStore;

struct QueuedSale {
    context: SaleContext,
    sale: SaleRecord,
    done: oneshot::Sender<Result<SaleOutcome, EngineError>>,
}

/// FIFO queue with a single worker; dropping the queue stops the worker once
/// the backlog drains.
pub struct SaleQueue {
    tx: mpsc::UnboundedSender<QueuedSale>,
}

impl SaleQueue {
    pub fn new(store: Arc<SaleStore>, sync: Arc<SalesSynchronizer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx, store, sync));
        Self { tx }
    }

    /// Queue a sale and wait for its definite outcome. Business rejections
    /// resolve as `SaleOutcome { success: false, .. }`; `Err` means an
    /// infrastructure fault, not a backend rejection.
    pub async fn submit(&self, sale: SaleRecord) -> Result<SaleOutcome, EngineError> {
        let mut context = SaleContext::new(&sale);
        context.transition(SaleState::Queued);

        let (done, rx) = oneshot::channel();
        self.tx
            .send(QueuedSale {
                context,
                sale,
                done,
            })
            .map_err(|_| EngineError::QueueClosed)?;

        rx.await.map_err(|_| EngineError::QueueClosed)?
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<QueuedSale>,
    store: Arc<SaleStore>,
    sync: Arc<SalesSynchronizer>,
) {
    while let Some(mut queued) = rx.recv().await {
        queued.context.transition(SaleState::Processing);

        // Persist first so the sale survives a crash or an offline stretch.
        // A local-storage failure is logged but does not abort the flow;
        // the remote attempt is still worth making.
        if let Err(e) = store.upsert(&queued.sale) {
            warn!(
                sale_id = %queued.sale.id,
                invoice_number = %queued.sale.invoice_number,
                error = %e,
                "failed to persist sale before submission; continuing network-only"
            );
        }

        let reply = match sync.sync_sale(&queued.sale).await {
            Ok(outcome) if outcome.success => {
                queued.context.confirm(outcome.backend_id.clone());
                info!(
                    sale_id = %queued.sale.id,
                    invoice_number = %queued.sale.invoice_number,
                    "sale confirmed"
                );
                Ok(outcome)
            }
            Ok(outcome) => {
                queued.context.fail(outcome.error.clone());
                Ok(outcome)
            }
            Err(e) => {
                queued.context.fail(Some(e.to_string()));
                Err(e)
            }
        };

        // The caller may have gone away; the queue keeps draining.
        let _ = queued.done.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::DbState;
    use crate::events::ChangeHub;
    use crate::models::SaleDraft;
    use crate::remote::mock::MockRemote;
    use crate::error::RemoteError;
    use std::time::Duration;

    struct Fixture {
        queue: SaleQueue,
        store: Arc<SaleStore>,
        remote: Arc<MockRemote>,
    }

    fn fixture_with_db(db: Arc<DbState>) -> Fixture {
        let store = Arc::new(SaleStore::new(db));
        let remote = Arc::new(MockRemote::new());
        let sync = Arc::new(SalesSynchronizer::new(
            Arc::clone(&store),
            remote.clone(),
            Arc::new(SyncConfig::default()),
            Arc::new(ChangeHub::default()),
        ));
        let queue = SaleQueue::new(Arc::clone(&store), sync);
        Fixture {
            queue,
            store,
            remote,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_db(Arc::new(DbState::in_memory().expect("in-memory db")))
    }

    fn sale(invoice: &str) -> SaleRecord {
        SaleRecord::from_draft(
            "s1",
            invoice,
            SaleDraft {
                subtotal: 5.0,
                total: 5.0,
                paid: 5.0,
                ..SaleDraft::default()
            },
        )
    }

    #[tokio::test]
    async fn test_submit_confirms_and_persists() {
        let f = fixture();
        let s = sale("INV-1");
        let sale_id = s.id.clone();

        let outcome = f.queue.submit(s).await.expect("no infrastructure fault");
        assert!(outcome.success);
        assert_eq!(outcome.backend_id.as_deref(), Some("r-1"));

        let local = f.store.get("s1", &sale_id).unwrap().expect("persisted");
        assert!(local.synced);
    }

    #[tokio::test]
    async fn test_business_failure_resolves_instead_of_rejecting() {
        let f = fixture();
        f.remote
            .push_create_result(Err(RemoteError::new(400, "Validation failed: no items")));

        let outcome = f
            .queue
            .submit(sale("INV-1"))
            .await
            .expect("resolved, not rejected");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Validation failed"));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_never_overlap() {
        let f = fixture();
        f.remote.set_submit_delay(Duration::from_millis(15));

        let mut handles = Vec::new();
        for i in 1..=6 {
            let queue_tx = f.queue.tx.clone();
            let s = sale(&format!("INV-{i}"));
            // Bypass submit() so every sale enqueues immediately.
            let (done, rx) = oneshot::channel();
            let mut context = SaleContext::new(&s);
            context.transition(SaleState::Queued);
            queue_tx
                .send(QueuedSale {
                    context,
                    sale: s,
                    done,
                })
                .unwrap();
            handles.push(rx);
        }

        for rx in handles {
            let outcome = rx.await.expect("delivered").expect("ok");
            assert!(outcome.success);
        }

        assert_eq!(f.remote.create_calls(), 6, "synchronizer invoked once per sale");
        assert_eq!(
            f.remote.max_in_flight(),
            1,
            "submissions must be strictly sequential"
        );
    }

    #[tokio::test]
    async fn test_fifo_order_is_preserved() {
        let f = fixture();
        f.remote.set_submit_delay(Duration::from_millis(5));

        let mut receivers = Vec::new();
        for i in 1..=4 {
            let s = sale(&format!("INV-{i}"));
            let (done, rx) = oneshot::channel();
            let mut context = SaleContext::new(&s);
            context.transition(SaleState::Queued);
            f.queue
                .tx
                .send(QueuedSale {
                    context,
                    sale: s,
                    done,
                })
                .unwrap();
            receivers.push((i, rx));
        }

        // Backend ids are assigned in acceptance order: r-1, r-2, ...
        for (i, rx) in receivers {
            let outcome = rx.await.expect("delivered").expect("ok");
            assert_eq!(outcome.backend_id.as_deref(), Some(format!("r-{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn test_store_failure_does_not_abort_submission() {
        // Network-only mode: every persist fails, the sale still reaches
        // the backend.
        let f = fixture_with_db(Arc::new(DbState::network_only()));

        let outcome = f.queue.submit(sale("INV-1")).await.expect("submitted");
        assert!(outcome.success);
        assert_eq!(f.remote.created_count(), 1);
    }
}
