//! Active-request tracking.
//!
//! Bulk catalog refreshes must not start while other remote traffic (a
//! token refresh, a sale submission burst) is still in flight, so every
//! remote call made through [`TrackedRemote`] is counted and
//! [`RequestTracker::wait_until_idle`] offers a bounded wait for the count
//! to reach zero.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{EngineError, RemoteError};
use crate::remote::{ProductBatch, ProductQuery, RemoteService, SalesFilter};

/// Counts in-flight remote requests.
pub struct RequestTracker {
    count: watch::Sender<usize>,
}

impl RequestTracker {
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self { count })
    }

    /// RAII guard; the count drops when the guard does.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.count.send_modify(|c| *c += 1);
        RequestGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no request is in flight, bounded by `timeout`.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut rx = self.count.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| EngineError::RequestDrainTimeout)
    }
}

pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}

/// Decorator that counts every call on the wrapped [`RemoteService`].
pub struct TrackedRemote {
    inner: Arc<dyn RemoteService>,
    tracker: Arc<RequestTracker>,
}

impl TrackedRemote {
    pub fn new(inner: Arc<dyn RemoteService>, tracker: Arc<RequestTracker>) -> Self {
        Self { inner, tracker }
    }
}

#[async_trait]
impl RemoteService for TrackedRemote {
    async fn ping(&self) -> bool {
        let _guard = self.tracker.begin();
        self.inner.ping().await
    }

    async fn create_sale(&self, store_id: &str, sale: &Value) -> Result<Value, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.create_sale(store_id, sale).await
    }

    async fn get_current_invoice_number(&self, store_id: &str) -> Result<i64, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.get_current_invoice_number(store_id).await
    }

    async fn get_sales(
        &self,
        store_id: &str,
        filter: &SalesFilter,
    ) -> Result<Vec<Value>, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.get_sales(store_id, filter).await
    }

    async fn get_product(&self, store_id: &str, product_id: &str) -> Result<Value, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.get_product(store_id, product_id).await
    }

    async fn update_product(
        &self,
        store_id: &str,
        product_id: &str,
        patch: &Value,
    ) -> Result<Value, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.update_product(store_id, product_id, patch).await
    }

    async fn get_products(
        &self,
        store_id: &str,
        query: ProductQuery,
    ) -> Result<ProductBatch, RemoteError> {
        let _guard = self.tracker.begin();
        self.inner.get_products(store_id, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_immediately_when_nothing_in_flight() {
        let tracker = RequestTracker::new();
        tracker
            .wait_until_idle(Duration::from_millis(50))
            .await
            .expect("idle tracker resolves at once");
    }

    #[tokio::test]
    async fn test_wait_resolves_when_guard_drops() {
        let tracker = RequestTracker::new();
        let guard = tracker.begin();
        assert_eq!(tracker.active(), 1);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_until_idle(Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        waiter.await.expect("join").expect("drained before timeout");
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_request_held() {
        let tracker = RequestTracker::new();
        let _guard = tracker.begin();

        let result = tracker.wait_until_idle(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(EngineError::RequestDrainTimeout)));
    }

    #[tokio::test]
    async fn test_tracked_remote_counts_calls() {
        let mock = Arc::new(crate::remote::mock::MockRemote::new());
        mock.set_submit_delay(Duration::from_millis(40));
        let tracker = RequestTracker::new();
        let tracked = Arc::new(TrackedRemote::new(mock.clone(), Arc::clone(&tracker)));

        let call = {
            let tracked = Arc::clone(&tracked);
            tokio::spawn(async move {
                tracked
                    .create_sale("s1", &serde_json::json!({ "invoiceNumber": "INV-1" }))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active(), 1, "call counted while in flight");

        call.await.expect("join").expect("sale accepted");
        assert_eq!(tracker.active(), 0, "count released after completion");
    }
}
