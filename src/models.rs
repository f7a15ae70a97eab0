//! Domain types for the sync engine.
//!
//! Every locally persisted entity is scoped by a store id; the composite id
//! `"{store_id}:{entity_id}"` is the stable primary key, so re-storing the
//! same entity is always an upsert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::json::{num_any, str_any};

/// Deterministic composite primary key for a store-scoped entity.
pub fn composite_id(store_id: &str, entity_id: &str) -> String {
    format!("{store_id}:{entity_id}")
}

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// A category of domain object with its own local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sale,
    Product,
    StockChange,
    Customer,
    Category,
    Brand,
    Unit,
}

impl EntityKind {
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Sale => "sales",
            EntityKind::Product => "products",
            EntityKind::StockChange => "stock_changes",
            EntityKind::Customer => "customers",
            EntityKind::Category => "categories",
            EntityKind::Brand => "brands",
            EntityKind::Unit => "units",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sale => "sale",
            EntityKind::Product => "product",
            EntityKind::StockChange => "stock_change",
            EntityKind::Customer => "customer",
            EntityKind::Category => "category",
            EntityKind::Brand => "brand",
            EntityKind::Unit => "unit",
        }
    }
}

// ---------------------------------------------------------------------------
// Generic record envelope
// ---------------------------------------------------------------------------

/// Envelope around a persisted entity instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord<T> {
    pub composite_id: String,
    pub store_id: String,
    pub entity_id: String,
    pub payload: T,
    pub last_updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

/// One line of a sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub product_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub line_total: f64,
}

/// A sale as persisted locally. `id` is client-generated and stable for the
/// sale's lifetime; `backend_id` is assigned once the backend accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
    pub id: String,
    pub store_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub invoice_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub items: Vec<SaleItem>,
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax: f64,
    pub total: f64,
    #[serde(default)]
    pub paid: f64,
    #[serde(default)]
    pub remaining: f64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SaleRecord {
    pub fn composite_id(&self) -> String {
        composite_id(&self.store_id, &self.id)
    }

    /// Build a persistable sale from UI input, assigning the client id and
    /// the invoice number issued by the sequencer.
    pub fn from_draft(store_id: &str, invoice_number: &str, draft: SaleDraft) -> Self {
        let remaining = (draft.total - draft.paid).max(0.0);
        Self {
            id: Uuid::new_v4().to_string(),
            store_id: store_id.to_string(),
            backend_id: None,
            invoice_number: invoice_number.to_string(),
            customer_id: draft.customer_id,
            items: draft.items,
            subtotal: draft.subtotal,
            discount: draft.discount,
            tax: draft.tax,
            total: draft.total,
            paid: draft.paid,
            remaining,
            synced: false,
            sync_error: None,
            created_at: Utc::now(),
        }
    }
}

/// What the UI hands over when ringing up a sale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDraft {
    #[serde(default)]
    pub items: Vec<SaleItem>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub paid: f64,
}

// ---------------------------------------------------------------------------
// Sale lifecycle
// ---------------------------------------------------------------------------

/// States a queued sale moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleState {
    Created,
    Queued,
    Processing,
    Confirmed,
    Failed,
}

/// Ephemeral per-submission state machine instance. Created when a sale is
/// queued, dropped once its outcome is delivered.
#[derive(Debug, Clone)]
pub struct SaleContext {
    pub sale_id: String,
    pub invoice_number: String,
    pub store_id: String,
    pub state: SaleState,
    pub error: Option<String>,
    pub backend_id: Option<String>,
}

impl SaleContext {
    pub fn new(sale: &SaleRecord) -> Self {
        Self {
            sale_id: sale.id.clone(),
            invoice_number: sale.invoice_number.clone(),
            store_id: sale.store_id.clone(),
            state: SaleState::Created,
            error: None,
            backend_id: None,
        }
    }

    pub fn transition(&mut self, next: SaleState) {
        debug!(
            sale_id = %self.sale_id,
            invoice_number = %self.invoice_number,
            from = ?self.state,
            to = ?next,
            "sale state transition"
        );
        self.state = next;
    }

    pub fn confirm(&mut self, backend_id: Option<String>) {
        self.backend_id = backend_id;
        self.transition(SaleState::Confirmed);
    }

    pub fn fail(&mut self, error: Option<String>) {
        self.error = error;
        self.transition(SaleState::Failed);
    }
}

/// Definite outcome of a sale submission. Business rejections are delivered
/// through this type with `success = false`; only infrastructure faults
/// surface as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SaleOutcome {
    pub fn confirmed(backend_id: Option<String>) -> Self {
        Self {
            success: true,
            backend_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            backend_id: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

/// Cached catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub stock: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

impl ProductRecord {
    /// Parse a catalog entry from a remote payload. Returns `None` when no
    /// usable id is present; such rows are logged and skipped by callers.
    pub fn from_remote(value: &Value) -> Option<Self> {
        let id = str_any(value, &["id", "productId", "product_id"])?;
        Some(Self {
            id,
            name: str_any(value, &["name", "productName", "product_name"]).unwrap_or_default(),
            barcode: str_any(value, &["barcode", "sku"]),
            price: num_any(value, &["price", "sellPrice", "sell_price"]).unwrap_or(0.0),
            stock: num_any(value, &["stock", "quantity", "stockQuantity"]).unwrap_or(0.0),
            category_id: str_any(value, &["categoryId", "category_id"]),
            brand_id: str_any(value, &["brandId", "brand_id"]),
            unit_id: str_any(value, &["unitId", "unit_id"]),
            backend_id: str_any(value, &["backendId", "backend_id"])
                .or_else(|| str_any(value, &["id", "productId", "product_id"])),
        })
    }
}

// ---------------------------------------------------------------------------
// Stock changes
// ---------------------------------------------------------------------------

/// Why local stock moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockOperation {
    Sale,
    Return,
    Adjustment,
}

impl StockOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockOperation::Sale => "sale",
            StockOperation::Return => "return",
            StockOperation::Adjustment => "adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sale" => Some(StockOperation::Sale),
            "return" => Some(StockOperation::Return),
            "adjustment" => Some(StockOperation::Adjustment),
            _ => None,
        }
    }
}

/// A queued local stock mutation, applied ahead of backend confirmation.
/// Several may coexist for one product; they are merged (deltas summed) at
/// sync time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockChangeRecord {
    pub id: String,
    pub store_id: String,
    pub product_id: String,
    pub old_stock: f64,
    pub new_stock: f64,
    pub change: f64,
    pub operation: StockOperation,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

impl StockChangeRecord {
    pub fn new(
        store_id: &str,
        product_id: &str,
        old_stock: f64,
        new_stock: f64,
        operation: StockOperation,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            store_id: store_id.to_string(),
            product_id: product_id.to_string(),
            old_stock,
            new_stock,
            change: new_stock - old_stock,
            operation,
            synced: false,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-sale failure detail from a batch drain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleSyncFailure {
    pub sale_id: String,
    pub invoice_number: String,
    pub error: String,
}

/// Result of draining the unsynced-sales backlog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesSyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<SaleSyncFailure>,
}

/// Result of draining pending stock changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySyncReport {
    pub products_considered: usize,
    pub products_synced: usize,
    pub products_failed: usize,
    pub changes_synced: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// What a catalog refresh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProductRefreshOutcome {
    Refreshed { fetched: usize, paged: bool },
    SkippedFresh,
    SkippedCooldown,
    SkippedInProgress,
}

/// Combined result of one background sync cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleReport {
    pub sales: SalesSyncReport,
    pub inventory: InventorySyncReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<ProductRefreshOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products_error: Option<String>,
}

/// Point-in-time queue depth snapshot for status surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub unsynced_sales: i64,
    pub sales_with_errors: i64,
    pub pending_stock_changes: i64,
    pub pending_fallback_entries: i64,
    pub tasks_queued: usize,
    pub local_store_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
}

/// Result of the logout flush-then-clear sequence. Every step runs even if a
/// prior one partially failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutReport {
    pub flushed_sales: usize,
    pub flush_failures: usize,
    pub cleared: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}
