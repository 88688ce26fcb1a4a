//! Local SQLite database layer for Kasir POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared connection state every module receives.
//!
//! All monetary columns are REAL rupiah amounts; timestamps are RFC 3339
//! UTC strings (or SQLite `datetime('now')` defaults for bookkeeping
//! columns). List-shaped data (line items, adjustment notes, journal
//! lines, audit snapshots) is stored as JSON text.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/kasir.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("kasir.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
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

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

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

    Ok(())
}

/// Migration v1: core store tables (items, transactions, shift reports,
/// journal, chart of accounts, users, settings).
fn migrate_v1(conn: &Connection) -> Result<(), String> {
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

        -- users (kasir + admin accounts)
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            nama TEXT,
            role TEXT NOT NULL DEFAULT 'kasir',
            password_hash TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- barang (item master subset: stock is the only concern of this core)
        CREATE TABLE IF NOT EXISTS barang (
            id TEXT PRIMARY KEY,
            nama TEXT NOT NULL,
            stok REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- transaksi (point-of-sale transactions)
        CREATE TABLE IF NOT EXISTS transaksi (
            id TEXT PRIMARY KEY,
            nomor TEXT,
            tanggal TEXT NOT NULL,
            total REAL NOT NULL DEFAULT 0,
            metode TEXT NOT NULL DEFAULT 'cash',
            kasir TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- tutup_kasir (closed shift reports; penyesuaian is an append-only
        -- JSON list of adjustment notes)
        CREATE TABLE IF NOT EXISTS tutup_kasir (
            id TEXT PRIMARY KEY,
            tanggal_tutup TEXT NOT NULL,
            total_penjualan REAL NOT NULL DEFAULT 0,
            total_kas REAL NOT NULL DEFAULT 0,
            total_piutang REAL NOT NULL DEFAULT 0,
            kasir TEXT,
            penyesuaian TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- jurnal (double-entry records; lines is a JSON list of
        -- {account, debit, credit})
        CREATE TABLE IF NOT EXISTS jurnal (
            id TEXT PRIMARY KEY,
            deskripsi TEXT NOT NULL,
            tanggal TEXT NOT NULL,
            tag TEXT,
            lines TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- chart_of_accounts
        CREATE TABLE IF NOT EXISTS chart_of_accounts (
            kode TEXT PRIMARY KEY,
            nama TEXT NOT NULL
        );

        INSERT OR IGNORE INTO chart_of_accounts (kode, nama) VALUES
            ('1-1000', 'Kas'),
            ('1-1200', 'Piutang Anggota'),
            ('1-1300', 'Persediaan Barang'),
            ('4-1000', 'Penjualan'),
            ('5-1000', 'Harga Pokok Penjualan');

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_transaksi_tanggal ON transaksi(tanggal);
        CREATE INDEX IF NOT EXISTS idx_tutup_kasir_tanggal ON tutup_kasir(tanggal_tutup);
        CREATE INDEX IF NOT EXISTS idx_jurnal_tag ON jurnal(tag);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (core store tables)");
    Ok(())
}

/// Migration v2: guard tables for the closed-shift deletion workflow
/// (password attempt tracking, per-user deletion rate log, critical
/// audit log).
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- password_attempts (per-user failure counter and lockout expiry)
        CREATE TABLE IF NOT EXISTS password_attempts (
            username TEXT PRIMARY KEY,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            locked_until TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- deletion_rate_log (append-only; current-day rows count toward
        -- the per-user quota)
        CREATE TABLE IF NOT EXISTS deletion_rate_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            audit_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- critical_audit_log (append-only forensic record; snapshot
        -- columns hold deep-copied JSON)
        CREATE TABLE IF NOT EXISTS critical_audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            audit_id TEXT UNIQUE NOT NULL,
            level TEXT NOT NULL DEFAULT 'CRITICAL',
            transaction_id TEXT NOT NULL,
            transaction_no TEXT,
            category TEXT,
            reason TEXT,
            deleted_by TEXT,
            password_verified_at TEXT,
            transaction_snapshot TEXT NOT NULL DEFAULT '{}',
            shift_before TEXT,
            shift_after TEXT,
            journal_lines TEXT NOT NULL DEFAULT '[]',
            adjustment_ref TEXT,
            validation_results TEXT,
            stock_restored INTEGER NOT NULL DEFAULT 0,
            warnings TEXT NOT NULL DEFAULT '[]',
            deleted_at TEXT NOT NULL,
            system_info TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_rate_log_user_day
            ON deletion_rate_log(username, created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_audit_id
            ON critical_audit_log(audit_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (deletion guard tables)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
