//! Append-only critical audit log for closed-shift deletions.
//!
//! Every committed deletion leaves one immutable forensic record holding
//! deep-copied snapshots of everything the operation touched: the deleted
//! transaction, the shift report before and after adjustment, the reversal
//! journal lines, the validation results, and system metadata. Later
//! mutation of the source rows can never alter a stored record.
//!
//! Audit ids are `AUDIT-CLOSED-YYYYMMDD-NNNN` with a per-day sequence
//! (count existing entries for the day, zero-pad count + 1). Not safe
//! under true parallelism; the store runs a single logical actor.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::{self, DbState};

/// Generate the next sequential audit id for today.
fn next_audit_id(conn: &Connection) -> Result<String, String> {
    let date_tag = Utc::now().format("%Y%m%d").to_string();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM critical_audit_log WHERE audit_id LIKE ?1",
            params![format!("AUDIT-CLOSED-{date_tag}-%")],
            |row| row.get(0),
        )
        .map_err(|e| format!("count audit entries: {e}"))?;
    Ok(format!("AUDIT-CLOSED-{date_tag}-{:04}", count + 1))
}

/// System metadata stored with each entry.
fn system_info(conn: &Connection) -> Value {
    serde_json::json!({
        "appVersion": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "storeName": db::get_setting(conn, "toko", "nama"),
        "deviceId": db::get_setting(conn, "toko", "device_id"),
    })
}

fn json_col(data: &Value, key: &str) -> String {
    data.get(key)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

/// Append a critical deletion record and return its audit id.
///
/// `data` carries `transactionId`, `transactionNo`, `category`, `reason`,
/// `deletedBy`, `passwordVerifiedAt`, `transactionSnapshot`, `shiftBefore`,
/// `shiftAfter`, `journalLines`, `adjustmentRef`, `validationResults`,
/// `stockRestored`, and `warnings`. Serializing the owned JSON values is
/// the deep copy: the stored text shares nothing with the source objects.
pub(crate) fn log_critical_deletion(conn: &Connection, data: &Value) -> Result<String, String> {
    let audit_id = next_audit_id(conn)?;
    let deleted_at = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO critical_audit_log (
            audit_id, level, transaction_id, transaction_no, category, reason,
            deleted_by, password_verified_at, transaction_snapshot,
            shift_before, shift_after, journal_lines, adjustment_ref,
            validation_results, stock_restored, warnings, deleted_at, system_info
        ) VALUES (?1, 'CRITICAL', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                  ?13, ?14, ?15, ?16, ?17)",
        params![
            audit_id,
            data.get("transactionId").and_then(Value::as_str).unwrap_or(""),
            data.get("transactionNo").and_then(Value::as_str),
            data.get("category").and_then(Value::as_str),
            data.get("reason").and_then(Value::as_str),
            data.get("deletedBy").and_then(Value::as_str),
            data.get("passwordVerifiedAt").and_then(Value::as_str),
            json_col(data, "transactionSnapshot"),
            json_col(data, "shiftBefore"),
            json_col(data, "shiftAfter"),
            json_col(data, "journalLines"),
            data.get("adjustmentRef").and_then(Value::as_str),
            json_col(data, "validationResults"),
            data.get("stockRestored").and_then(Value::as_bool).unwrap_or(false),
            json_col(data, "warnings"),
            deleted_at,
            system_info(conn).to_string(),
        ],
    )
    .map_err(|e| format!("insert audit entry: {e}"))?;

    info!(audit_id = %audit_id, "critical audit entry written");
    Ok(audit_id)
}

/// Map an audit row (full column set) to JSON.
fn row_to_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let parse = |raw: String| -> Value {
        serde_json::from_str(&raw).unwrap_or_else(|_| {
            warn!("corrupt JSON column in audit log entry");
            Value::Null
        })
    };

    Ok(serde_json::json!({
        "auditId": row.get::<_, String>(0)?,
        "level": row.get::<_, String>(1)?,
        "transactionId": row.get::<_, String>(2)?,
        "transactionNo": row.get::<_, Option<String>>(3)?,
        "category": row.get::<_, Option<String>>(4)?,
        "reason": row.get::<_, Option<String>>(5)?,
        "deletedBy": row.get::<_, Option<String>>(6)?,
        "passwordVerifiedAt": row.get::<_, Option<String>>(7)?,
        "transactionSnapshot": parse(row.get::<_, String>(8)?),
        "shiftBefore": row.get::<_, Option<String>>(9)?.map(&parse).unwrap_or(Value::Null),
        "shiftAfter": row.get::<_, Option<String>>(10)?.map(&parse).unwrap_or(Value::Null),
        "journalLines": parse(row.get::<_, String>(11)?),
        "adjustmentRef": row.get::<_, Option<String>>(12)?,
        "validationResults": row.get::<_, Option<String>>(13)?.map(&parse).unwrap_or(Value::Null),
        "stockRestored": row.get::<_, bool>(14)?,
        "warnings": parse(row.get::<_, String>(15)?),
        "deletedAt": row.get::<_, String>(16)?,
        "systemInfo": parse(row.get::<_, String>(17)?),
    }))
}

const AUDIT_COLUMNS: &str = "audit_id, level, transaction_id, transaction_no, category, reason,
    deleted_by, password_verified_at, transaction_snapshot, shift_before,
    shift_after, journal_lines, adjustment_ref, validation_results,
    stock_restored, warnings, deleted_at, system_info";

/// All critical audit entries, newest first.
pub fn get_critical_history(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM critical_audit_log ORDER BY id DESC"
        ))
        .map_err(|e| e.to_string())?;

    let rows = stmt.query_map([], row_to_json).map_err(|e| e.to_string())?;

    let mut entries = Vec::new();
    for row in rows {
        match row {
            Ok(e) => entries.push(e),
            Err(e) => warn!("skipping unreadable audit row: {e}"),
        }
    }

    Ok(serde_json::json!({
        "success": true,
        "entries": entries,
    }))
}

/// Fetch one audit entry by id.
fn get_entry(conn: &Connection, audit_id: &str) -> Result<Option<Value>, String> {
    conn.query_row(
        &format!("SELECT {AUDIT_COLUMNS} FROM critical_audit_log WHERE audit_id = ?1"),
        params![audit_id],
        row_to_json,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(format!("read audit entry {audit_id}: {other}")),
    })
}

/// Build a presentation-ready report structure for one audit entry.
///
/// Returns JSON null for an unknown id. The shift section is null when no
/// shift snapshot was stored.
pub fn export_report(db: &DbState, audit_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let Some(entry) = get_entry(&conn, audit_id)? else {
        return Ok(Value::Null);
    };

    let shift_section = if entry["shiftBefore"].is_null() {
        Value::Null
    } else {
        serde_json::json!({
            "before": entry["shiftBefore"],
            "after": entry["shiftAfter"],
            "adjustmentRef": entry["adjustmentRef"],
        })
    };

    Ok(serde_json::json!({
        "title": "LAPORAN PENGHAPUSAN TRANSAKSI KRITIS",
        "auditId": entry["auditId"],
        "level": entry["level"],
        "transaction": {
            "id": entry["transactionId"],
            "nomor": entry["transactionNo"],
            "snapshot": entry["transactionSnapshot"],
        },
        "shift": shift_section,
        "deletion": {
            "category": entry["category"],
            "reason": entry["reason"],
            "deletedBy": entry["deletedBy"],
            "deletedAt": entry["deletedAt"],
            "passwordVerifiedAt": entry["passwordVerifiedAt"],
            "stockRestored": entry["stockRestored"],
            "warnings": entry["warnings"],
        },
        "journalLines": entry["journalLines"],
        "system": entry["systemInfo"],
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
