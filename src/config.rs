//! Engine configuration.
//!
//! Every backoff, cooldown, and pacing value is an operational tuning knob,
//! not an invariant; embedders override the defaults per deployment.

use std::time::Duration;

/// Tuning values for the sync engine. Shared across components as an
/// `Arc<SyncConfig>`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between background sync cycles.
    pub sync_interval: Duration,
    /// Pause between consecutive sale submissions when draining the backlog,
    /// so a long offline stretch does not hammer the backend on reconnect.
    pub sale_sync_pacing: Duration,
    /// A local product cache updated within this window is considered fresh;
    /// a non-forced refresh is skipped.
    pub product_freshness: Duration,
    /// Minimum gap between two full catalog refreshes.
    pub product_refresh_cooldown: Duration,
    /// How long a catalog refresh waits for in-flight requests to drain
    /// before abandoning.
    pub request_drain_timeout: Duration,
    /// Page size for the paged catalog fallback.
    pub product_page_size: u32,
    /// Attempts per page before the paged fallback gives up on a page.
    pub product_page_retries: u32,
    /// Human-facing invoice number prefix (`INV-1`, `INV-2`, ...).
    pub invoice_prefix: String,
    /// Timeout for ordinary remote calls.
    pub remote_timeout: Duration,
    /// Timeout for the lightweight connectivity probe.
    pub ping_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            sale_sync_pacing: Duration::from_millis(500),
            product_freshness: Duration::from_secs(5 * 60),
            product_refresh_cooldown: Duration::from_secs(60),
            request_drain_timeout: Duration::from_secs(10),
            product_page_size: 200,
            product_page_retries: 3,
            invoice_prefix: "INV".to_string(),
            remote_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = SyncConfig::default();
        assert!(config.product_freshness > config.product_refresh_cooldown);
        assert!(config.product_page_retries >= 1);
        assert_eq!(config.invoice_prefix, "INV");
    }
}
