//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the shared
//! connection state, and the settings helpers used for per-store operational
//! stamps. If the database cannot be opened even after deleting a corrupt
//! file, the state degrades to network-only mode: every store operation
//! reports [`StoreError::Unavailable`] and callers continue without offline
//! durability.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::StoreError;

/// Shared database state. The connection is absent in network-only mode and
/// after [`DbState::close`].
pub struct DbState {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "till.db";

impl DbState {
    /// Open the database at `{data_dir}/till.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once; if the retry also fails the state
    /// degrades to network-only mode instead of refusing to start.
    pub fn open(data_dir: &Path) -> DbState {
        if let Err(e) = fs::create_dir_all(data_dir) {
            warn!("Failed to create data dir, running network-only: {e}");
            return DbState::network_only();
        }

        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => Some(c),
            Err(first_err) => {
                warn!("Database open failed ({first_err}), deleting and retrying once");
                remove_db_files(&db_path);
                match open_and_configure(&db_path) {
                    Ok(c) => Some(c),
                    Err(e) => {
                        error!("Database open failed after retry, running network-only: {e}");
                        None
                    }
                }
            }
        };

        let conn = match conn {
            Some(c) => match run_migrations(&c) {
                Ok(()) => {
                    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");
                    Some(c)
                }
                Err(e) => {
                    error!("Migration failed, running network-only: {e}");
                    None
                }
            },
            None => None,
        };

        DbState {
            conn: Mutex::new(conn),
            db_path,
        }
    }

    /// A state with no backing database: sales still reach the backend
    /// directly, only offline durability is lost.
    pub fn network_only() -> DbState {
        DbState {
            conn: Mutex::new(None),
            db_path: PathBuf::from(":memory:"),
        }
    }

    /// An in-memory database with the full schema. Used by tests and by
    /// embedders that want a throwaway replica.
    pub fn in_memory() -> Result<DbState, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::sqlite("open in-memory db"))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(StoreError::sqlite("pragma setup"))?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(Some(conn)),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether the local replica is usable.
    pub fn is_available(&self) -> bool {
        matches!(self.conn.lock().as_deref(), Ok(Some(_)))
    }

    /// Run `f` against the connection, mapping SQLite failures to a
    /// [`StoreError`] carrying `context`.
    pub fn with_conn<T>(
        &self,
        context: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        match guard.as_ref() {
            Some(conn) => f(conn).map_err(StoreError::sqlite(context)),
            None => Err(StoreError::Unavailable),
        }
    }

    /// Close the connection. Further operations report `Unavailable`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if let Some(conn) = guard.take() {
                if let Err((_conn, e)) = conn.close() {
                    warn!("Database close reported an error: {e}");
                }
            }
        }
    }

    /// Close the connection and delete the database file (plus WAL/SHM
    /// side files). Part of the logout teardown contract.
    pub fn destroy(&self) {
        self.close();
        if self.db_path.as_os_str() != ":memory:" {
            remove_db_files(&self.db_path);
            info!("Database files removed at {}", self.db_path.display());
        }
    }
}

fn remove_db_files(db_path: &Path) {
    if db_path.exists() {
        let _ = fs::remove_file(db_path);
    }
    let wal = db_path.with_extension("db-wal");
    let shm = db_path.with_extension("db-shm");
    let _ = fs::remove_file(wal);
    let _ = fs::remove_file(shm);
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(StoreError::sqlite("create schema_version"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, sales, and the product cache.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sales
        CREATE TABLE IF NOT EXISTS sales (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            sale_id TEXT NOT NULL,
            backend_id TEXT,
            invoice_number TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            synced INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- products
        CREATE TABLE IF NOT EXISTS products (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            barcode TEXT,
            stock REAL NOT NULL DEFAULT 0,
            payload TEXT NOT NULL DEFAULT '{}',
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sales_store_invoice
            ON sales(store_id, invoice_number);
        CREATE INDEX IF NOT EXISTS idx_sales_store_synced ON sales(store_id, synced);
        CREATE INDEX IF NOT EXISTS idx_sales_store_created ON sales(store_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_products_store ON products(store_id);
        CREATE INDEX IF NOT EXISTS idx_products_store_barcode ON products(store_id, barcode);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::sqlite("migration v1")(e)
    })
}

/// Migration v2: stock change queue and the plain document tables.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS stock_changes (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            old_stock REAL NOT NULL DEFAULT 0,
            new_stock REAL NOT NULL DEFAULT 0,
            change REAL NOT NULL DEFAULT 0,
            operation TEXT NOT NULL DEFAULT 'adjustment',
            synced INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS customers (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS categories (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS brands (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS units (
            composite_id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_stock_changes_store_synced
            ON stock_changes(store_id, synced);
        CREATE INDEX IF NOT EXISTS idx_stock_changes_store_product
            ON stock_changes(store_id, product_id);
        CREATE INDEX IF NOT EXISTS idx_customers_store ON customers(store_id);
        CREATE INDEX IF NOT EXISTS idx_categories_store ON categories(store_id);
        CREATE INDEX IF NOT EXISTS idx_brands_store ON brands(store_id);
        CREATE INDEX IF NOT EXISTS idx_units_store ON units(store_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::sqlite("migration v2")(e)
    })
}

/// Migration v3: generic append-only intent log for the fallback sync path.
fn migrate_v3(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_store ON sync_queue(store_id, id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        StoreError::sqlite("migration v3")(e)
    })
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read one `local_settings` value.
pub fn setting_get(db: &DbState, category: &str, key: &str) -> Option<String> {
    db.with_conn("get local setting", |conn| {
        conn.query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            rusqlite::params![category, key],
            |row| row.get::<_, String>(0),
        )
    })
    .ok()
}

/// Upsert one `local_settings` value.
pub fn setting_set(db: &DbState, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
    db.with_conn("set local setting", |conn| {
        conn.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
            rusqlite::params![category, key, value],
        )
    })?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
