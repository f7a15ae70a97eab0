//! Typed stores over the local SQLite replica.
//!
//! Each entity kind gets its own table and a typed accessor. All upserts are
//! merge-based: fields the incoming writer does not know about (a `backendId`
//! assigned by a concurrent writer, a recorded sync error) survive the write.
//! Sync bookkeeping transitions (`mark_synced`, `record_sync_error`) go
//! through a read-modify-replace path instead, because they must be able to
//! clear fields the merge rule would preserve.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::error::StoreError;
use crate::json::{merge_objects, strip_keys};
use crate::models::{
    composite_id, EntityKind, LocalRecord, ProductRecord, SaleRecord, StockChangeRecord,
    StockOperation,
};

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

/// Store-scoped sale table with a secondary unique index on
/// `(store_id, invoice_number)`.
pub struct SaleStore {
    db: Arc<DbState>,
}

impl SaleStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Merge-upsert a sale keyed by `(store_id, id)`.
    ///
    /// An insert that collides on the invoice-number index is resolved by
    /// merging into the record already holding that number (the primary key
    /// of the existing row stays stable); if the index lookup itself fails
    /// transiently, a full scan locates the conflicting row before anything
    /// is duplicated.
    pub fn upsert(&self, sale: &SaleRecord) -> Result<(), StoreError> {
        if sale.store_id.trim().is_empty() {
            return Err(StoreError::MissingStoreId);
        }
        let incoming =
            serde_json::to_value(sale).map_err(StoreError::serialize("serialize sale"))?;
        let cid = sale.composite_id();

        let existing: Option<String> = self.db.with_conn("lookup sale for upsert", |conn| {
            conn.query_row(
                "SELECT payload FROM sales WHERE composite_id = ?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()
        })?;

        match existing {
            Some(raw) => {
                let existing_payload: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                let merged_value = merge_objects(&existing_payload, &incoming);
                let merged: SaleRecord = serde_json::from_value(merged_value)
                    .map_err(StoreError::serialize("merge sale payload"))?;
                self.replace(&cid, &merged)
            }
            None => self.insert_new(sale, &incoming),
        }
    }

    fn insert_new(&self, sale: &SaleRecord, incoming: &Value) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let payload_str = incoming.to_string();
        let result = self.db.with_conn("insert sale", |conn| {
            conn.execute(
                "INSERT INTO sales (
                    composite_id, store_id, sale_id, backend_id, invoice_number,
                    payload, synced, sync_error, created_at, last_updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    sale.composite_id(),
                    sale.store_id,
                    sale.id,
                    sale.backend_id,
                    sale.invoice_number,
                    payload_str,
                    sale.synced as i64,
                    sale.sync_error,
                    now,
                ],
            )
        });

        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Sqlite { source, .. }) if is_unique_violation(&source) => {
                self.resolve_invoice_conflict(sale, incoming)
            }
            Err(e) => Err(e),
        }
    }

    /// Two writers raced on the same `(store_id, invoice_number)`. Merge the
    /// late writer's fields into the row that won, keeping its identity.
    fn resolve_invoice_conflict(
        &self,
        sale: &SaleRecord,
        incoming: &Value,
    ) -> Result<(), StoreError> {
        warn!(
            store_id = %sale.store_id,
            invoice_number = %sale.invoice_number,
            "sale upsert hit invoice-number conflict; merging into existing record"
        );

        let existing = match self.get_by_invoice_number(&sale.store_id, &sale.invoice_number) {
            Ok(found) => found,
            Err(e) => {
                // The index lookup failed transiently; a full scan is slower
                // but cannot create a duplicate.
                warn!(error = %e, "invoice index lookup failed; falling back to full scan");
                self.find_by_invoice_scan(&sale.store_id, &sale.invoice_number)?
            }
        };

        let Some(current) = existing else {
            return Err(StoreError::UnresolvedConflict {
                context: "sales(store_id, invoice_number)",
            });
        };

        let existing_value = serde_json::to_value(&current)
            .map_err(StoreError::serialize("serialize existing sale"))?;
        // The existing row keeps its client id.
        let incoming_keyless = strip_keys(incoming, &["id"]);
        let merged_value = merge_objects(&existing_value, &incoming_keyless);
        let merged: SaleRecord = serde_json::from_value(merged_value)
            .map_err(StoreError::serialize("merge conflicting sale"))?;
        self.replace(&current.composite_id(), &merged)
    }

    /// Overwrite a row with the given record, no merge. Used after a
    /// read-modify cycle where fields must be clearable.
    fn replace(&self, cid: &str, sale: &SaleRecord) -> Result<(), StoreError> {
        let payload_str = serde_json::to_value(sale)
            .map_err(StoreError::serialize("serialize sale"))?
            .to_string();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn("update sale", |conn| {
            conn.execute(
                "UPDATE sales SET
                    backend_id = ?1,
                    invoice_number = ?2,
                    payload = ?3,
                    synced = ?4,
                    sync_error = ?5,
                    last_updated_at = ?6
                 WHERE composite_id = ?7",
                params![
                    sale.backend_id,
                    sale.invoice_number,
                    payload_str,
                    sale.synced as i64,
                    sale.sync_error,
                    now,
                    cid,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, store_id: &str, sale_id: &str) -> Result<Option<SaleRecord>, StoreError> {
        let cid = composite_id(store_id, sale_id);
        let raw: Option<String> = self.db.with_conn("get sale", |conn| {
            conn.query_row(
                "SELECT payload FROM sales WHERE composite_id = ?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(raw.and_then(|s| parse_sale_payload(&s)))
    }

    pub fn get_by_invoice_number(
        &self,
        store_id: &str,
        invoice_number: &str,
    ) -> Result<Option<SaleRecord>, StoreError> {
        let raw: Option<String> = self.db.with_conn("get sale by invoice", |conn| {
            conn.query_row(
                "SELECT payload FROM sales WHERE store_id = ?1 AND invoice_number = ?2",
                params![store_id, invoice_number],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(raw.and_then(|s| parse_sale_payload(&s)))
    }

    /// Locate a sale by invoice number without touching the secondary index.
    fn find_by_invoice_scan(
        &self,
        store_id: &str,
        invoice_number: &str,
    ) -> Result<Option<SaleRecord>, StoreError> {
        Ok(self
            .get_all(store_id)?
            .into_iter()
            .find(|s| s.invoice_number == invoice_number))
    }

    /// All sales for a store, oldest first.
    pub fn get_all(&self, store_id: &str) -> Result<Vec<SaleRecord>, StoreError> {
        let raw: Vec<String> = self.db.with_conn("get all sales", |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM sales WHERE store_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![store_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        Ok(raw.iter().filter_map(|s| parse_sale_payload(s)).collect())
    }

    /// Unsynced sales for a store, oldest first.
    pub fn unsynced(&self, store_id: &str) -> Result<Vec<SaleRecord>, StoreError> {
        let raw: Vec<String> = self.db.with_conn("get unsynced sales", |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM sales
                 WHERE store_id = ?1 AND synced = 0
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![store_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        Ok(raw.iter().filter_map(|s| parse_sale_payload(s)).collect())
    }

    /// Record backend acceptance: synced, error cleared, backend id set.
    pub fn mark_synced(
        &self,
        store_id: &str,
        sale_id: &str,
        backend_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(mut sale) = self.get(store_id, sale_id)? else {
            warn!(store_id, sale_id, "mark_synced: sale not found locally");
            return Ok(());
        };
        sale.synced = true;
        sale.sync_error = None;
        if let Some(id) = backend_id {
            sale.backend_id = Some(id.to_string());
        }
        self.replace(&composite_id(store_id, sale_id), &sale)
    }

    /// Record a retryable sync failure. The sale stays unsynced and is
    /// picked up by the next periodic drain.
    pub fn record_sync_error(
        &self,
        store_id: &str,
        sale_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let Some(mut sale) = self.get(store_id, sale_id)? else {
            warn!(store_id, sale_id, "record_sync_error: sale not found locally");
            return Ok(());
        };
        sale.synced = false;
        sale.sync_error = Some(error.to_string());
        self.replace(&composite_id(store_id, sale_id), &sale)
    }

    /// Highest locally used numeric suffix among `{prefix}-{n}` invoice
    /// numbers, used to seed the sequencer when the backend is unreachable.
    pub fn highest_invoice_number(
        &self,
        store_id: &str,
        prefix: &str,
    ) -> Result<i64, StoreError> {
        let numbers: Vec<String> = self.db.with_conn("scan invoice numbers", |conn| {
            let mut stmt =
                conn.prepare("SELECT invoice_number FROM sales WHERE store_id = ?1")?;
            let rows = stmt
                .query_map(params![store_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let lead = format!("{prefix}-");
        let highest = numbers
            .iter()
            .filter_map(|n| n.strip_prefix(&lead))
            .filter_map(|n| n.parse::<i64>().ok())
            .max()
            .unwrap_or(0);
        Ok(highest)
    }

    pub fn count_unsynced(&self, store_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn("count unsynced sales", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sales WHERE store_id = ?1 AND synced = 0",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    pub fn count_with_errors(&self, store_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn("count errored sales", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sales
                 WHERE store_id = ?1 AND sync_error IS NOT NULL",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    pub fn delete(&self, store_id: &str, sale_id: &str) -> Result<bool, StoreError> {
        let cid = composite_id(store_id, sale_id);
        let deleted = self.db.with_conn("delete sale", |conn| {
            conn.execute("DELETE FROM sales WHERE composite_id = ?1", params![cid])
        })?;
        Ok(deleted > 0)
    }

    pub fn clear_for_store(&self, store_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn("clear sales", |conn| {
            conn.execute("DELETE FROM sales WHERE store_id = ?1", params![store_id])
        })
    }
}

fn parse_sale_payload(raw: &str) -> Option<SaleRecord> {
    match serde_json::from_str(raw) {
        Ok(sale) => Some(sale),
        Err(e) => {
            warn!("skipping malformed sale row: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

/// Local product catalog cache.
pub struct ProductStore {
    db: Arc<DbState>,
}

impl ProductStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Merge-upsert one catalog entry keyed by `(store_id, id)`.
    pub fn upsert(&self, store_id: &str, product: &ProductRecord) -> Result<(), StoreError> {
        if store_id.trim().is_empty() {
            return Err(StoreError::MissingStoreId);
        }
        let incoming =
            serde_json::to_value(product).map_err(StoreError::serialize("serialize product"))?;
        let cid = composite_id(store_id, &product.id);

        let existing: Option<String> = self.db.with_conn("lookup product for upsert", |conn| {
            conn.query_row(
                "SELECT payload FROM products WHERE composite_id = ?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()
        })?;

        let (final_value, is_update) = match existing {
            Some(raw) => {
                let existing_payload: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                (merge_objects(&existing_payload, &incoming), true)
            }
            None => (incoming, false),
        };
        let merged: ProductRecord = serde_json::from_value(final_value.clone())
            .map_err(StoreError::serialize("merge product payload"))?;
        let payload_str = final_value.to_string();
        let now = Utc::now().to_rfc3339();

        if is_update {
            self.db.with_conn("update product", |conn| {
                conn.execute(
                    "UPDATE products SET
                        name = ?1, barcode = ?2, stock = ?3, payload = ?4, last_updated_at = ?5
                     WHERE composite_id = ?6",
                    params![merged.name, merged.barcode, merged.stock, payload_str, now, cid],
                )
            })?;
        } else {
            self.db.with_conn("insert product", |conn| {
                conn.execute(
                    "INSERT INTO products (
                        composite_id, store_id, product_id, name, barcode, stock,
                        payload, last_updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        cid,
                        store_id,
                        merged.id,
                        merged.name,
                        merged.barcode,
                        merged.stock,
                        payload_str,
                        now,
                    ],
                )
            })?;
        }
        Ok(())
    }

    pub fn get(&self, store_id: &str, product_id: &str) -> Result<Option<ProductRecord>, StoreError> {
        let cid = composite_id(store_id, product_id);
        let raw: Option<String> = self.db.with_conn("get product", |conn| {
            conn.query_row(
                "SELECT payload FROM products WHERE composite_id = ?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(raw.and_then(|s| parse_product_payload(&s)))
    }

    pub fn get_all(&self, store_id: &str) -> Result<Vec<ProductRecord>, StoreError> {
        let raw: Vec<String> = self.db.with_conn("get all products", |conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM products WHERE store_id = ?1 ORDER BY name ASC")?;
            let rows = stmt
                .query_map(params![store_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        Ok(raw.iter().filter_map(|s| parse_product_payload(s)).collect())
    }

    /// Name or barcode substring lookup for the sell screen.
    pub fn search_by_text(&self, store_id: &str, query: &str) -> Result<Vec<ProductRecord>, StoreError> {
        let pattern = format!("%{}%", query.trim());
        let raw: Vec<String> = self.db.with_conn("search products", |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM products
                 WHERE store_id = ?1 AND (name LIKE ?2 OR barcode LIKE ?2)
                 ORDER BY name ASC",
            )?;
            let rows = stmt
                .query_map(params![store_id, pattern], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        Ok(raw.iter().filter_map(|s| parse_product_payload(s)).collect())
    }

    /// Write an absolute stock level (column and payload stay consistent).
    /// Missing products are logged and skipped; a stock write must never
    /// fail a sale.
    pub fn set_stock(&self, store_id: &str, product_id: &str, stock: f64) -> Result<(), StoreError> {
        let Some(mut product) = self.get(store_id, product_id)? else {
            debug!(store_id, product_id, "set_stock: product not cached locally");
            return Ok(());
        };
        product.stock = stock;
        let payload_str = serde_json::to_value(&product)
            .map_err(StoreError::serialize("serialize product"))?
            .to_string();
        let cid = composite_id(store_id, product_id);
        let now = Utc::now().to_rfc3339();
        self.db.with_conn("set product stock", |conn| {
            conn.execute(
                "UPDATE products SET stock = ?1, payload = ?2, last_updated_at = ?3
                 WHERE composite_id = ?4",
                params![stock, payload_str, now, cid],
            )
        })?;
        Ok(())
    }

    /// Timestamp of the most recently refreshed record, for freshness checks.
    pub fn newest_update(&self, store_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<String> = self.db.with_conn("newest product update", |conn| {
            conn.query_row(
                "SELECT MAX(last_updated_at) FROM products WHERE store_id = ?1",
                params![store_id],
                |row| row.get(0),
            )
        })?;
        Ok(raw.as_deref().map(parse_timestamp))
    }

    pub fn count(&self, store_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn("count products", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM products WHERE store_id = ?1",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    pub fn clear_for_store(&self, store_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn("clear products", |conn| {
            conn.execute("DELETE FROM products WHERE store_id = ?1", params![store_id])
        })
    }
}

fn parse_product_payload(raw: &str) -> Option<ProductRecord> {
    match serde_json::from_str(raw) {
        Ok(product) => Some(product),
        Err(e) => {
            warn!("skipping malformed product row: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Stock changes
// ---------------------------------------------------------------------------

/// Queue of local stock mutations awaiting backend reconciliation.
pub struct StockChangeStore {
    db: Arc<DbState>,
}

impl StockChangeStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn insert(&self, change: &StockChangeRecord) -> Result<(), StoreError> {
        if change.store_id.trim().is_empty() {
            return Err(StoreError::MissingStoreId);
        }
        self.db.with_conn("insert stock change", |conn| {
            conn.execute(
                "INSERT INTO stock_changes (
                    id, store_id, product_id, old_stock, new_stock, change,
                    operation, synced, retry_count, created_at, last_updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    change.id,
                    change.store_id,
                    change.product_id,
                    change.old_stock,
                    change.new_stock,
                    change.change,
                    change.operation.as_str(),
                    change.synced as i64,
                    change.retry_count,
                    change.created_at.to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    /// Pending changes for a store, oldest first.
    pub fn unsynced(&self, store_id: &str) -> Result<Vec<StockChangeRecord>, StoreError> {
        type Row = (String, String, String, f64, f64, f64, String, i64, String);
        let rows: Vec<Row> = self.db.with_conn("get unsynced stock changes", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, store_id, product_id, old_stock, new_stock, change,
                        operation, retry_count, created_at
                 FROM stock_changes
                 WHERE store_id = ?1 AND synced = 0
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![store_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .map(
                |(id, store_id, product_id, old_stock, new_stock, change, op, retries, created)| {
                    StockChangeRecord {
                        id,
                        store_id,
                        product_id,
                        old_stock,
                        new_stock,
                        change,
                        operation: StockOperation::parse(&op).unwrap_or(StockOperation::Adjustment),
                        synced: false,
                        retry_count: retries,
                        created_at: parse_timestamp(&created),
                    }
                },
            )
            .collect())
    }

    pub fn mark_synced(&self, store_id: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut updated = 0usize;
        for id in ids {
            updated += self.db.with_conn("mark stock change synced", |conn| {
                conn.execute(
                    "UPDATE stock_changes
                     SET synced = 1, last_updated_at = datetime('now')
                     WHERE store_id = ?1 AND id = ?2",
                    params![store_id, id],
                )
            })?;
        }
        Ok(updated)
    }

    pub fn bump_retry(&self, store_id: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut updated = 0usize;
        for id in ids {
            updated += self.db.with_conn("bump stock change retry", |conn| {
                conn.execute(
                    "UPDATE stock_changes
                     SET retry_count = retry_count + 1, last_updated_at = datetime('now')
                     WHERE store_id = ?1 AND id = ?2",
                    params![store_id, id],
                )
            })?;
        }
        Ok(updated)
    }

    pub fn count_unsynced(&self, store_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn("count unsynced stock changes", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM stock_changes WHERE store_id = ?1 AND synced = 0",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    pub fn clear_for_store(&self, store_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn("clear stock changes", |conn| {
            conn.execute(
                "DELETE FROM stock_changes WHERE store_id = ?1",
                params![store_id],
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Generic document tables
// ---------------------------------------------------------------------------

/// Typed accessor for the plain document tables (customers, categories,
/// brands, units). One table per kind, same schema, merge-based upsert.
pub struct DocStore<T> {
    db: Arc<DbState>,
    kind: EntityKind,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> DocStore<T> {
    pub fn new(db: Arc<DbState>, kind: EntityKind) -> Self {
        Self {
            db,
            kind,
            _payload: PhantomData,
        }
    }

    fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    pub fn upsert(&self, store_id: &str, entity_id: &str, payload: &T) -> Result<(), StoreError> {
        if store_id.trim().is_empty() {
            return Err(StoreError::MissingStoreId);
        }
        let incoming =
            serde_json::to_value(payload).map_err(StoreError::serialize("serialize document"))?;
        let cid = composite_id(store_id, entity_id);
        let table = self.table();

        let existing: Option<String> = self.db.with_conn("lookup document", |conn| {
            conn.query_row(
                &format!("SELECT payload FROM {table} WHERE composite_id = ?1"),
                params![cid],
                |row| row.get(0),
            )
            .optional()
        })?;

        let final_value = match existing {
            Some(raw) => {
                let existing_payload: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                merge_objects(&existing_payload, &incoming)
            }
            None => incoming,
        };
        let payload_str = final_value.to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn("upsert document", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (composite_id, store_id, entity_id, payload, last_updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(composite_id) DO UPDATE SET
                        payload = excluded.payload,
                        last_updated_at = excluded.last_updated_at"
                ),
                params![cid, store_id, entity_id, payload_str, now],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, store_id: &str, entity_id: &str) -> Result<Option<LocalRecord<T>>, StoreError> {
        let cid = composite_id(store_id, entity_id);
        let table = self.table();
        let row: Option<(String, String)> = self.db.with_conn("get document", |conn| {
            conn.query_row(
                &format!("SELECT payload, last_updated_at FROM {table} WHERE composite_id = ?1"),
                params![cid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;

        match row {
            Some((raw, updated)) => match serde_json::from_str(&raw) {
                Ok(payload) => Ok(Some(LocalRecord {
                    composite_id: cid,
                    store_id: store_id.to_string(),
                    entity_id: entity_id.to_string(),
                    payload,
                    last_updated_at: parse_timestamp(&updated),
                })),
                Err(e) => {
                    warn!(table, "skipping malformed document row: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn get_all(&self, store_id: &str) -> Result<Vec<LocalRecord<T>>, StoreError> {
        let table = self.table();
        let rows: Vec<(String, String, String)> = self.db.with_conn("get all documents", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT entity_id, payload, last_updated_at FROM {table}
                 WHERE store_id = ?1 ORDER BY entity_id ASC"
            ))?;
            let rows = stmt
                .query_map(params![store_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(entity_id, raw, updated)| match serde_json::from_str(&raw) {
                Ok(payload) => Some(LocalRecord {
                    composite_id: composite_id(store_id, &entity_id),
                    store_id: store_id.to_string(),
                    entity_id,
                    payload,
                    last_updated_at: parse_timestamp(&updated),
                }),
                Err(e) => {
                    warn!(table, "skipping malformed document row: {e}");
                    None
                }
            })
            .collect())
    }

    pub fn delete(&self, store_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        let cid = composite_id(store_id, entity_id);
        let table = self.table();
        let deleted = self.db.with_conn("delete document", |conn| {
            conn.execute(
                &format!("DELETE FROM {table} WHERE composite_id = ?1"),
                params![cid],
            )
        })?;
        Ok(deleted > 0)
    }

    pub fn clear_for_store(&self, store_id: &str) -> Result<usize, StoreError> {
        let table = self.table();
        self.db.with_conn("clear documents", |conn| {
            conn.execute(
                &format!("DELETE FROM {table} WHERE store_id = ?1"),
                params![store_id],
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Generic intent log (fallback sync path)
// ---------------------------------------------------------------------------

/// A pending create/update/delete intent from the append log.
#[derive(Debug, Clone)]
pub struct SyncIntent {
    pub id: i64,
    pub store_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub created_at: String,
}

/// Append-only log of mutation intents, ordered by insertion. Independent of
/// the sale lifecycle queue; consumed only by the generic fallback sync path.
pub struct SyncQueueLog {
    db: Arc<DbState>,
}

impl SyncQueueLog {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        store_id: &str,
        kind: EntityKind,
        entity_id: &str,
        operation: &str,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let payload_str = payload.to_string();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn("append sync intent", |conn| {
            conn.execute(
                "INSERT INTO sync_queue (store_id, entity_type, entity_id, operation, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![store_id, kind.as_str(), entity_id, operation, payload_str, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Pending intents in insertion order.
    pub fn pending(&self, store_id: &str) -> Result<Vec<SyncIntent>, StoreError> {
        type Row = (i64, String, String, String, String, String);
        let rows: Vec<Row> = self.db.with_conn("read sync intents", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, entity_id, operation, payload, created_at
                 FROM sync_queue WHERE store_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![store_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .map(|(id, entity_type, entity_id, operation, payload, created_at)| SyncIntent {
                id,
                store_id: store_id.to_string(),
                entity_type,
                entity_id,
                operation,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                created_at,
            })
            .collect())
    }

    pub fn remove(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self.db.with_conn("remove sync intent", |conn| {
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
        })?;
        Ok(deleted > 0)
    }

    pub fn count(&self, store_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn("count sync intents", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE store_id = ?1",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    pub fn clear_for_store(&self, store_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn("clear sync intents", |conn| {
            conn.execute(
                "DELETE FROM sync_queue WHERE store_id = ?1",
                params![store_id],
            )
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
