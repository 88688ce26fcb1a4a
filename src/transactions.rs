//! Transaction reads and stock restoration.
//!
//! Transactions are created by the point-of-sale flow (out of scope here);
//! this core only reads them, deletes them through the orchestrator, and
//! puts line-item quantities back on the shelf when a deletion commits.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;

/// Map a `transaksi` row to JSON. `items` is parsed; corrupt item JSON is
/// surfaced as an error so validation can report it instead of panicking.
fn row_to_json(
    id: String,
    nomor: Option<String>,
    tanggal: String,
    total: f64,
    metode: String,
    kasir: Option<String>,
    items_raw: String,
) -> Result<Value, String> {
    let items: Value = serde_json::from_str(&items_raw)
        .map_err(|e| format!("corrupt items JSON for transaction {id}: {e}"))?;

    Ok(serde_json::json!({
        "id": id,
        "nomor": nomor,
        "tanggal": tanggal,
        "total": total,
        "metode": metode,
        "kasir": kasir,
        "items": items,
    }))
}

/// Fetch a single transaction as JSON, `None` if absent.
pub fn get_transaction(db: &DbState, transaction_id: &str) -> Result<Option<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    get_transaction_conn(&conn, transaction_id)
}

/// Connection-level variant for callers already holding the lock.
pub(crate) fn get_transaction_conn(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<Value>, String> {
    let row = conn
        .query_row(
            "SELECT id, nomor, tanggal, total, metode, kasir, items
             FROM transaksi WHERE id = ?1",
            params![transaction_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(format!("read transaction {transaction_id}: {other}")),
        })?;

    match row {
        Some((id, nomor, tanggal, total, metode, kasir, items_raw)) => {
            row_to_json(id, nomor, tanggal, total, metode, kasir, items_raw).map(Some)
        }
        None => Ok(None),
    }
}

/// Whether a transaction row exists.
pub(crate) fn transaction_exists(conn: &Connection, transaction_id: &str) -> Result<bool, String> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM transaksi WHERE id = ?1",
            params![transaction_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("check transaction exists: {e}"))?;
    Ok(count > 0)
}

/// List transactions, newest first (read surface for the caller/UI).
pub fn list_transactions(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, nomor, tanggal, total, metode, kasir, items
             FROM transaksi ORDER BY tanggal DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .map_err(|e| e.to_string())?;

    let mut transactions = Vec::new();
    for row in rows {
        match row {
            Ok((id, nomor, tanggal, total, metode, kasir, items_raw)) => {
                match row_to_json(id, nomor, tanggal, total, metode, kasir, items_raw) {
                    Ok(v) => transactions.push(v),
                    Err(e) => warn!("skipping malformed transaction row: {e}"),
                }
            }
            Err(e) => warn!("skipping unreadable transaction row: {e}"),
        }
    }

    Ok(serde_json::json!({
        "success": true,
        "transactions": transactions,
    }))
}

/// Put line-item quantities back into `barang.stok`.
///
/// Items whose master row no longer exists are logged and skipped; the
/// deletion still proceeds (the item may have been retired since the sale).
/// Returns the number of item rows actually restored.
pub(crate) fn restore_stock(conn: &Connection, items: &Value) -> Result<u32, String> {
    let Some(items) = items.as_array() else {
        return Err("transaction items is not a list".to_string());
    };

    let mut restored = 0u32;
    for item in items {
        let Some(item_id) = item.get("id").and_then(Value::as_str) else {
            warn!("line item without id, skipping stock restore for it");
            continue;
        };
        let qty = item.get("qty").and_then(Value::as_f64).unwrap_or(0.0);

        let updated = conn
            .execute(
                "UPDATE barang SET stok = stok + ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![qty, item_id],
            )
            .map_err(|e| format!("restore stock for {item_id}: {e}"))?;

        if updated == 0 {
            warn!(item_id = %item_id, "item no longer in master, stock not restored");
        } else {
            restored += 1;
        }
    }

    Ok(restored)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn seed_transaction(db: &DbState, id: &str, items_json: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transaksi (id, nomor, tanggal, total, metode, kasir, items)
             VALUES (?1, ?2, '2026-08-25T10:00:00+00:00', 50000, 'cash', 'budi', ?3)",
            params![id, format!("TRX-{id}"), items_json],
        )
        .unwrap();
    }

    #[test]
    fn get_transaction_parses_items() {
        let db = test_db();
        seed_transaction(
            &db,
            "t1",
            r#"[{"id":"b1","nama":"Gula","qty":2,"harga":25000,"hpp":15000}]"#,
        );

        let trx = get_transaction(&db, "t1").unwrap().unwrap();
        assert_eq!(trx["nomor"], "TRX-t1");
        assert_eq!(trx["items"][0]["qty"], 2);
        assert_eq!(trx["items"][0]["hpp"], 15000);

        assert!(get_transaction(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn corrupt_items_surface_as_error() {
        let db = test_db();
        seed_transaction(&db, "t2", "{not json");

        let err = get_transaction(&db, "t2").unwrap_err();
        assert!(err.contains("corrupt items JSON"));
    }

    #[test]
    fn restore_stock_adds_quantities_back() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO barang (id, nama, stok) VALUES ('b1', 'Gula', 10), ('b2', 'Kopi', 3)",
            [],
        )
        .unwrap();

        let items = serde_json::json!([
            {"id": "b1", "qty": 2},
            {"id": "b2", "qty": 5},
            {"id": "b-gone", "qty": 1},
        ]);
        let restored = restore_stock(&conn, &items).unwrap();
        assert_eq!(restored, 2, "missing item skipped");

        let stok: f64 = conn
            .query_row("SELECT stok FROM barang WHERE id = 'b1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stok, 12.0);
        let stok: f64 = conn
            .query_row("SELECT stok FROM barang WHERE id = 'b2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stok, 8.0);
    }
}
