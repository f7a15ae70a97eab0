//! Local-first invoice sequence generator.
//!
//! Issues `{prefix}-{n}` numbers from a per-store monotonic counter. The
//! counter seeds from the backend when reachable, from the highest locally
//! recorded number otherwise, and from zero as the last resort. It can only
//! ever move up: a stale, lower value reported by the backend never rewinds
//! a number that may already have been issued.
//!
//! Issuance is not synchronized across processes; true concurrent issuance
//! is caught by the backend's uniqueness check and repaired by the sales
//! synchronizer's conflict recovery.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::remote::RemoteService;
use crate::store::SaleStore;

#[derive(Debug, Default, Clone, Copy)]
struct CounterState {
    current: i64,
    initialized: bool,
}

/// Per-store invoice counters, lazily initialized once per store session.
pub struct InvoiceSequencer {
    sales: Arc<SaleStore>,
    remote: Arc<dyn RemoteService>,
    config: Arc<SyncConfig>,
    counters: Mutex<HashMap<String, CounterState>>,
}

impl InvoiceSequencer {
    pub fn new(
        sales: Arc<SaleStore>,
        remote: Arc<dyn RemoteService>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            sales,
            remote,
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the counter for a store. Idempotent and memoized; the remote
    /// sequence is consulted first, then the local sale history, then zero.
    pub async fn initialize(&self, store_id: &str) {
        let mut counters = self.counters.lock().await;
        if counters.get(store_id).map(|c| c.initialized) == Some(true) {
            return;
        }

        let seed = match self.remote.get_current_invoice_number(store_id).await {
            Ok(n) => {
                info!(store_id, seed = n, "invoice counter seeded from backend");
                n
            }
            Err(e) => {
                debug!(store_id, error = %e, "backend sequence unavailable, scanning local sales");
                match self
                    .sales
                    .highest_invoice_number(store_id, &self.config.invoice_prefix)
                {
                    Ok(n) => {
                        info!(store_id, seed = n, "invoice counter seeded from local history");
                        n
                    }
                    Err(e) => {
                        debug!(store_id, error = %e, "local scan unavailable, seeding from zero");
                        0
                    }
                }
            }
        };

        let entry = counters.entry(store_id.to_string()).or_default();
        // Numbers may already have been issued this session; never go back.
        entry.current = entry.current.max(seed);
        entry.initialized = true;
    }

    /// Increment and return the next number for a store, initializing lazily.
    pub async fn next_invoice_number(&self, store_id: &str) -> String {
        {
            let counters = self.counters.lock().await;
            if counters.get(store_id).map(|c| c.initialized) != Some(true) {
                drop(counters);
                self.initialize(store_id).await;
            }
        }

        let mut counters = self.counters.lock().await;
        let entry = counters.entry(store_id.to_string()).or_default();
        entry.current += 1;
        format!("{}-{}", self.config.invoice_prefix, entry.current)
    }

    /// Re-align with the backend's authoritative counter. Only ever raises
    /// the local value; returns the counter after alignment.
    pub async fn sync_with_backend(&self, store_id: &str) -> Result<i64, crate::error::RemoteError> {
        let remote_value = self.remote.get_current_invoice_number(store_id).await?;

        let mut counters = self.counters.lock().await;
        let entry = counters.entry(store_id.to_string()).or_default();
        if remote_value > entry.current {
            info!(
                store_id,
                local = entry.current,
                remote = remote_value,
                "raising invoice counter to backend value"
            );
            entry.current = remote_value;
        } else if remote_value < entry.current {
            debug!(
                store_id,
                local = entry.current,
                remote = remote_value,
                "backend reported a stale lower counter; keeping local value"
            );
        }
        entry.initialized = true;
        Ok(entry.current)
    }

    /// Current counter value without issuing a number (0 if untouched).
    pub async fn current(&self, store_id: &str) -> i64 {
        self.counters
            .lock()
            .await
            .get(store_id)
            .map(|c| c.current)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbState;
    use crate::models::{SaleDraft, SaleRecord};
    use crate::remote::mock::MockRemote;

    fn sequencer(remote: Arc<MockRemote>) -> (InvoiceSequencer, Arc<SaleStore>) {
        let db = Arc::new(DbState::in_memory().expect("in-memory db"));
        let sales = Arc::new(SaleStore::new(db));
        let seq = InvoiceSequencer::new(
            Arc::clone(&sales),
            remote,
            Arc::new(SyncConfig::default()),
        );
        (seq, sales)
    }

    #[tokio::test]
    async fn test_fresh_store_issues_inv_1_then_inv_2() {
        // Backend sequence unreachable and no local sales: seed is zero.
        let remote = Arc::new(MockRemote::new());
        remote.fail_invoice_lookup();
        let (seq, _) = sequencer(remote);

        assert_eq!(seq.next_invoice_number("s1").await, "INV-1");
        assert_eq!(seq.next_invoice_number("s1").await, "INV-2");
    }

    #[tokio::test]
    async fn test_seeds_from_backend_when_reachable() {
        let remote = Arc::new(MockRemote::new());
        remote.set_invoice_number(41);
        let (seq, _) = sequencer(remote.clone());

        assert_eq!(seq.next_invoice_number("s1").await, "INV-42");
        // Memoized: a second issue does not re-query the backend.
        assert_eq!(seq.next_invoice_number("s1").await, "INV-43");
        assert_eq!(remote.invoice_calls(), 1);
    }

    #[tokio::test]
    async fn test_seeds_from_local_history_when_backend_down() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_invoice_lookup();
        let (seq, sales) = sequencer(remote);

        sales
            .upsert(&SaleRecord::from_draft("s1", "INV-7", SaleDraft::default()))
            .unwrap();

        assert_eq!(seq.next_invoice_number("s1").await, "INV-8");
    }

    #[tokio::test]
    async fn test_numbers_are_strictly_increasing() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_invoice_lookup();
        let (seq, _) = sequencer(remote);

        let mut previous = 0i64;
        for _ in 0..20 {
            let number = seq.next_invoice_number("s1").await;
            let n: i64 = number.strip_prefix("INV-").unwrap().parse().unwrap();
            assert!(n > previous, "{n} must exceed {previous}");
            previous = n;
        }
    }

    #[tokio::test]
    async fn test_sync_with_backend_never_lowers() {
        let remote = Arc::new(MockRemote::new());
        remote.set_invoice_number(10);
        let (seq, _) = sequencer(remote.clone());
        seq.initialize("s1").await;
        assert_eq!(seq.current("s1").await, 10);

        // Backend temporarily reports a stale, lower value.
        remote.set_invoice_number(4);
        let aligned = seq.sync_with_backend("s1").await.expect("sync ok");
        assert_eq!(aligned, 10, "counter must not regress");

        remote.set_invoice_number(25);
        let aligned = seq.sync_with_backend("s1").await.expect("sync ok");
        assert_eq!(aligned, 25, "counter rises to the backend value");
    }

    #[tokio::test]
    async fn test_counters_are_scoped_per_store() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_invoice_lookup();
        let (seq, _) = sequencer(remote);

        assert_eq!(seq.next_invoice_number("s1").await, "INV-1");
        assert_eq!(seq.next_invoice_number("s2").await, "INV-1");
        assert_eq!(seq.next_invoice_number("s1").await, "INV-2");
    }
}
