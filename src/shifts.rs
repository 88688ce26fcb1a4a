//! Shift report ("tutup kasir") reads and compensating adjustments.
//!
//! Once a shift closes its totals are frozen and reported. Deleting a
//! transaction inside it therefore applies a compensating numeric
//! adjustment plus an append-only adjustment note, never a recompute.
//!
//! Shift identification matches the shift whose closing **calendar day**
//! equals the transaction's day. A shift spanning midnight, or two shifts
//! closed on the same day, are ambiguous under this rule; the earliest
//! closing wins. Known limitation, kept deliberately.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::db::DbState;

/// Map a `tutup_kasir` row to JSON with the adjustment list parsed.
fn row_to_json(
    id: String,
    tanggal_tutup: String,
    total_penjualan: f64,
    total_kas: f64,
    total_piutang: f64,
    kasir: Option<String>,
    penyesuaian_raw: String,
) -> Result<Value, String> {
    let penyesuaian: Value = serde_json::from_str(&penyesuaian_raw)
        .map_err(|e| format!("corrupt adjustment list for shift {id}: {e}"))?;

    Ok(serde_json::json!({
        "id": id,
        "tanggalTutup": tanggal_tutup,
        "totalPenjualan": total_penjualan,
        "totalKas": total_kas,
        "totalPiutang": total_piutang,
        "kasir": kasir,
        "penyesuaian": penyesuaian,
    }))
}

const SHIFT_COLUMNS: &str =
    "id, tanggal_tutup, total_penjualan, total_kas, total_piutang, kasir, penyesuaian";

type ShiftRow = (String, String, f64, f64, f64, Option<String>, String);

fn map_shift_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShiftRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

/// Fetch a shift report by id as JSON, `None` if absent.
pub fn get_shift(db: &DbState, shift_id: &str) -> Result<Option<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    get_shift_conn(&conn, shift_id)
}

/// Connection-level variant for callers already holding the lock.
pub(crate) fn get_shift_conn(conn: &Connection, shift_id: &str) -> Result<Option<Value>, String> {
    let row = conn
        .query_row(
            &format!("SELECT {SHIFT_COLUMNS} FROM tutup_kasir WHERE id = ?1"),
            params![shift_id],
            map_shift_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(format!("read shift {shift_id}: {other}")),
        })?;

    match row {
        Some((id, tanggal, penjualan, kas, piutang, kasir, notes)) => {
            row_to_json(id, tanggal, penjualan, kas, piutang, kasir, notes).map(Some)
        }
        None => Ok(None),
    }
}

/// Find the shift report whose closing day matches the transaction's day.
///
/// Returns `None` when no shift closed on that calendar day.
pub(crate) fn identify_shift(
    conn: &Connection,
    transaction: &Value,
) -> Result<Option<Value>, String> {
    let Some(tanggal) = transaction.get("tanggal").and_then(Value::as_str) else {
        return Err("transaction has no date".to_string());
    };

    let row = conn
        .query_row(
            &format!(
                "SELECT {SHIFT_COLUMNS} FROM tutup_kasir
                 WHERE date(tanggal_tutup) = date(?1)
                 ORDER BY tanggal_tutup LIMIT 1"
            ),
            params![tanggal],
            map_shift_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(format!("identify shift: {other}")),
        })?;

    match row {
        Some((id, tanggal, penjualan, kas, piutang, kasir, notes)) => {
            row_to_json(id, tanggal, penjualan, kas, piutang, kasir, notes).map(Some)
        }
        None => Ok(None),
    }
}

/// Apply the compensating adjustment for a deleted transaction.
///
/// Subtracts `total` from the sales total unconditionally, and from the
/// cash total (cash sale) or the receivable total (bon sale) — the other
/// bucket is untouched. Appends an adjustment note; prior notes are
/// preserved unchanged. Returns before/after snapshots for the audit
/// record.
pub(crate) fn adjust_tutup_kasir(
    conn: &Connection,
    transaction: &Value,
    shift_id: &str,
) -> Result<Value, String> {
    let before = get_shift_conn(conn, shift_id)?
        .ok_or_else(|| format!("Shift report not found: {shift_id}"))?;

    let total = transaction.get("total").and_then(Value::as_f64).unwrap_or(0.0);
    let metode = transaction
        .get("metode")
        .and_then(Value::as_str)
        .unwrap_or("cash");
    let transaction_id = transaction.get("id").and_then(Value::as_str).unwrap_or("");
    let nomor = transaction.get("nomor").and_then(Value::as_str).unwrap_or("");

    let total_penjualan = before["totalPenjualan"].as_f64().unwrap_or(0.0) - total;
    let mut total_kas = before["totalKas"].as_f64().unwrap_or(0.0);
    let mut total_piutang = before["totalPiutang"].as_f64().unwrap_or(0.0);
    if metode == "cash" {
        total_kas -= total;
    } else {
        total_piutang -= total;
    }

    let now = Utc::now().to_rfc3339();
    let note = serde_json::json!({
        "timestamp": now,
        "transactionId": transaction_id,
        "transactionNo": nomor,
        "amount": total,
        "type": "deletion",
        "reference": format!("Penghapusan transaksi {nomor} setelah tutup kasir"),
    });

    let mut notes = before["penyesuaian"].as_array().cloned().unwrap_or_default();
    notes.push(note.clone());
    let notes_raw = serde_json::to_string(&notes)
        .map_err(|e| format!("serialize adjustment notes: {e}"))?;

    conn.execute(
        "UPDATE tutup_kasir SET
            total_penjualan = ?1,
            total_kas = ?2,
            total_piutang = ?3,
            penyesuaian = ?4,
            updated_at = datetime('now')
         WHERE id = ?5",
        params![total_penjualan, total_kas, total_piutang, notes_raw, shift_id],
    )
    .map_err(|e| format!("update shift totals: {e}"))?;

    let after = get_shift_conn(conn, shift_id)?
        .ok_or_else(|| format!("Shift report vanished during adjustment: {shift_id}"))?;

    info!(
        shift_id = %shift_id,
        transaction = %nomor,
        amount = %total,
        metode = %metode,
        "shift report adjusted for deleted transaction"
    );

    Ok(serde_json::json!({
        "success": true,
        "adjustmentData": {
            "shiftId": shift_id,
            "snapshotBefore": before,
            "snapshotAfter": after,
            "adjustmentNote": note,
        },
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
