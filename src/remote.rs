//! Remote POS backend client.
//!
//! The engine talks to the backend through the object-safe [`RemoteService`]
//! trait; [`HttpRemote`] is the production implementation. Transport details
//! stay here: synchronizers only ever see success, a payload, or a
//! [`RemoteError`] with an HTTP-like status.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::info;

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::json::i64_any;

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// Filter for remote sale lookups.
#[derive(Debug, Clone, Default)]
pub struct SalesFilter {
    pub invoice_number: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Catalog fetch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductQuery {
    /// Single bulk fetch of the whole catalog.
    All,
    /// One page of the paged fallback.
    Page { page: u32, per_page: u32 },
}

/// One catalog response: raw product payloads plus the server-reported total
/// (when the backend provides one; used to verify bulk-fetch completeness).
#[derive(Debug, Clone, Default)]
pub struct ProductBatch {
    pub items: Vec<Value>,
    pub total: Option<i64>,
}

/// Opaque remote POS backend.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Lightweight connectivity probe.
    async fn ping(&self) -> bool;

    async fn create_sale(&self, store_id: &str, sale: &Value) -> Result<Value, RemoteError>;

    async fn get_current_invoice_number(&self, store_id: &str) -> Result<i64, RemoteError>;

    async fn get_sales(
        &self,
        store_id: &str,
        filter: &SalesFilter,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn get_product(&self, store_id: &str, product_id: &str) -> Result<Value, RemoteError>;

    async fn update_product(
        &self,
        store_id: &str,
        product_id: &str,
        patch: &Value,
    ) -> Result<Value, RemoteError>;

    async fn get_products(
        &self,
        store_id: &str,
        query: ProductQuery,
    ) -> Result<ProductBatch, RemoteError>;
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Where and how to reach the backend.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
}

impl RemoteConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
        }
    }

    /// Decode a packed pairing string: a base64url JSON blob carrying `url`
    /// and `key`, as issued by the backend's device-pairing screen. Plain
    /// JSON is accepted too.
    pub fn from_connection_string(raw: &str) -> Option<Self> {
        let payload = decode_connection_string_payload(raw)?;
        let url = payload.get("url").and_then(Value::as_str)?;
        let key = payload.get("key").and_then(Value::as_str)?;
        if url.trim().is_empty() || key.trim().is_empty() {
            return None;
        }
        Some(Self::new(url, key))
    }
}

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub(crate) fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message with no status.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::network(format!("Cannot reach POS backend at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return RemoteError::network(format!("Invalid POS backend URL: {url}"));
    }
    RemoteError::network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Store not authorized".to_string(),
        404 => "POS backend endpoint not found".to_string(),
        409 => "Duplicate unique key rejected by POS backend".to_string(),
        429 => "POS backend is rate limiting; retry later".to_string(),
        s if s >= 500 => format!("POS backend server error (HTTP {s})"),
        s => format!("Unexpected response from POS backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed [`RemoteService`].
pub struct HttpRemote {
    config: RemoteConfig,
    client: Client,
    ping_client: Client,
}

impl HttpRemote {
    pub fn new(remote: RemoteConfig, config: &SyncConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.remote_timeout)
            .build()
            .map_err(|e| RemoteError::network(format!("Failed to create HTTP client: {e}")))?;
        let ping_client = Client::builder()
            .timeout(config.ping_timeout)
            .build()
            .map_err(|e| RemoteError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            config: remote,
            client,
            ping_client,
        })
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn fetch(
        &self,
        store_id: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let full_url = format!("{}{}", self.config.base_url, path);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.config.api_key)
            .header("x-store-id", store_id)
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.config.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve validation details for sync-error bookkeeping.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                let message = json
                    .get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status));
                let details = json.get("details").or_else(|| json.get("errors")).cloned();
                if let Some(details) = details {
                    format!("{message} (HTTP {}): {}", status.as_u16(), details)
                } else {
                    format!("{message} (HTTP {})", status.as_u16())
                }
            } else if !body_text.trim().is_empty() {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(RemoteError::new(status.as_u16(), detail));
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::network(format!("Invalid JSON from POS backend: {e}")))
    }
}

/// Pull a list payload out of a response that may be a bare array or an
/// envelope under one of the usual keys.
fn extract_list(resp: &Value, keys: &[&str]) -> Vec<Value> {
    if let Some(arr) = resp.as_array() {
        return arr.clone();
    }
    for key in keys {
        if let Some(arr) = resp.get(key).and_then(Value::as_array) {
            return arr.clone();
        }
    }
    Vec::new()
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn ping(&self) -> bool {
        let health_url = format!("{}/api/health", self.config.base_url);
        match self
            .ping_client
            .head(&health_url)
            .header("X-POS-API-Key", &self.config.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn create_sale(&self, store_id: &str, sale: &Value) -> Result<Value, RemoteError> {
        let resp = self
            .fetch(store_id, Method::POST, "/api/pos/sales", Some(sale))
            .await?;
        info!(store_id, "sale accepted by POS backend");
        Ok(resp
            .get("sale")
            .or_else(|| resp.get("data"))
            .cloned()
            .unwrap_or(resp))
    }

    async fn get_current_invoice_number(&self, store_id: &str) -> Result<i64, RemoteError> {
        let resp = self
            .fetch(store_id, Method::GET, "/api/pos/sales/sequence", None)
            .await?;
        i64_any(
            &resp,
            &["current_number", "currentNumber", "current", "sequence"],
        )
        .ok_or_else(|| {
            RemoteError::network("Invoice sequence response missing counter value".to_string())
        })
    }

    async fn get_sales(
        &self,
        store_id: &str,
        filter: &SalesFilter,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut path = "/api/pos/sales?".to_string();
        if let Some(invoice) = &filter.invoice_number {
            path.push_str(&format!("invoice_number={}&", percent_encode(invoice)));
        }
        if let Some(since) = &filter.since {
            let stamp = since.to_rfc3339_opts(SecondsFormat::Millis, true);
            path.push_str(&format!("since={}&", percent_encode(&stamp)));
        }
        let path = path.trim_end_matches(['&', '?']).to_string();

        let resp = self.fetch(store_id, Method::GET, &path, None).await?;
        Ok(extract_list(&resp, &["sales", "data", "items"]))
    }

    async fn get_product(&self, store_id: &str, product_id: &str) -> Result<Value, RemoteError> {
        let path = format!("/api/pos/products/{}", percent_encode(product_id));
        let resp = self.fetch(store_id, Method::GET, &path, None).await?;
        Ok(resp
            .get("product")
            .or_else(|| resp.get("data"))
            .cloned()
            .unwrap_or(resp))
    }

    async fn update_product(
        &self,
        store_id: &str,
        product_id: &str,
        patch: &Value,
    ) -> Result<Value, RemoteError> {
        let path = format!("/api/pos/products/{}", percent_encode(product_id));
        let resp = self
            .fetch(store_id, Method::PATCH, &path, Some(patch))
            .await?;
        Ok(resp
            .get("product")
            .or_else(|| resp.get("data"))
            .cloned()
            .unwrap_or(resp))
    }

    async fn get_products(
        &self,
        store_id: &str,
        query: ProductQuery,
    ) -> Result<ProductBatch, RemoteError> {
        let path = match query {
            ProductQuery::All => "/api/pos/products?all=true".to_string(),
            ProductQuery::Page { page, per_page } => {
                format!("/api/pos/products?page={page}&per_page={per_page}")
            }
        };
        let resp = self.fetch(store_id, Method::GET, &path, None).await?;
        let items = extract_list(&resp, &["products", "data", "items"]);
        let total = i64_any(&resp, &["total", "totalCount", "total_count", "count"]);
        Ok(ProductBatch { items, total })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("pos.example.com/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_base_url("https://pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:3000"),
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_connection_string_roundtrip() {
        let payload = serde_json::json!({
            "url": "pos.example.com",
            "key": "k-123456"
        });
        let encoded = BASE64_STANDARD.encode(payload.to_string());

        let config = RemoteConfig::from_connection_string(&encoded).expect("decodes");
        assert_eq!(config.base_url, "https://pos.example.com");
        assert_eq!(config.api_key, "k-123456");

        // Plain JSON is accepted too.
        let config = RemoteConfig::from_connection_string(&payload.to_string()).expect("decodes");
        assert_eq!(config.api_key, "k-123456");

        assert!(RemoteConfig::from_connection_string("garbage").is_none());
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("INV-12"), "INV-12");
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_extract_list_shapes() {
        let bare = serde_json::json!([{ "id": 1 }]);
        assert_eq!(extract_list(&bare, &["sales"]).len(), 1);

        let wrapped = serde_json::json!({ "sales": [{ "id": 1 }, { "id": 2 }] });
        assert_eq!(extract_list(&wrapped, &["sales", "data"]).len(), 2);

        let empty = serde_json::json!({ "unrelated": true });
        assert!(extract_list(&empty, &["sales"]).is_empty());
    }
}

// ===========================================================================
// Scripted mock backend (shared by module tests)
// ===========================================================================
