//! Data integrity checks around the deletion mutation.
//!
//! Pre-validation runs before anything is touched and aborts the whole
//! operation cheaply. Post-validation runs inside the still-open
//! transaction after all writes; any failure there triggers rollback.
//! Store read failures (corrupt serialized state) are reported as
//! validation errors, never propagated as panics or raw errors.

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::{shifts, transactions};

fn result(errors: Vec<String>) -> Value {
    serde_json::json!({
        "valid": errors.is_empty(),
        "errors": errors,
    })
}

/// Pre-conditions: the transaction exists and is complete, and a closed
/// shift report can be associated with its date.
pub(crate) fn pre_delete_validation(conn: &Connection, transaction_id: &str) -> Value {
    let mut errors = Vec::new();

    let trx = match transactions::get_transaction_conn(conn, transaction_id) {
        Ok(Some(trx)) => Some(trx),
        Ok(None) => {
            errors.push(format!("Transaction {transaction_id} not found"));
            None
        }
        Err(e) => {
            errors.push(format!("Failed to read transaction: {e}"));
            None
        }
    };

    if let Some(trx) = &trx {
        if trx.get("nomor").and_then(Value::as_str).unwrap_or("").is_empty() {
            errors.push(format!("Transaction {transaction_id} has no number"));
        }
        if trx.get("tanggal").and_then(Value::as_str).unwrap_or("").is_empty() {
            errors.push(format!("Transaction {transaction_id} has no date"));
        }
        match trx.get("items").and_then(Value::as_array) {
            Some(items) if !items.is_empty() => {}
            _ => errors.push(format!("Transaction {transaction_id} has no line items")),
        }

        match shifts::identify_shift(conn, trx) {
            Ok(Some(shift)) => {
                if shift.get("id").and_then(Value::as_str).unwrap_or("").is_empty() {
                    errors.push("Matched shift report has no id".to_string());
                }
                if shift.get("totalPenjualan").and_then(Value::as_f64).is_none() {
                    errors.push("Matched shift report has no sales total".to_string());
                }
            }
            Ok(None) => {
                errors.push(format!(
                    "No closed shift report matches the date of transaction {transaction_id}"
                ));
            }
            Err(e) => errors.push(format!("Failed to read shift reports: {e}")),
        }
    }

    result(errors)
}

/// Post-conditions, checked against the uncommitted state:
/// transaction gone, stock restored, every journal record present, the
/// shift carries an adjustment note for this transaction, and the audit
/// entry exists with its mandatory fields.
///
/// `ctx = {transactionId, shiftId, auditId, stockRestored, journalEntries}`.
pub(crate) fn post_delete_validation(conn: &Connection, ctx: &Value) -> Value {
    let mut errors = Vec::new();

    let transaction_id = ctx.get("transactionId").and_then(Value::as_str).unwrap_or("");
    let shift_id = ctx.get("shiftId").and_then(Value::as_str).unwrap_or("");
    let audit_id = ctx.get("auditId").and_then(Value::as_str).unwrap_or("");

    match transactions::transaction_exists(conn, transaction_id) {
        Ok(true) => errors.push(format!(
            "Transaction {transaction_id} still exists after deletion"
        )),
        Ok(false) => {}
        Err(e) => errors.push(format!("Failed to re-read transaction: {e}")),
    }

    if !ctx.get("stockRestored").and_then(Value::as_bool).unwrap_or(false) {
        errors.push("Stock was not restored".to_string());
    }

    // Each journal record must be individually findable by description
    let journal_entries = ctx
        .get("journalEntries")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in &journal_entries {
        let deskripsi = entry.get("deskripsi").and_then(Value::as_str).unwrap_or("");
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM jurnal WHERE deskripsi = ?1",
                params![deskripsi],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if found == 0 {
            errors.push(format!("Journal record not persisted: {deskripsi}"));
        }
    }

    match shifts::get_shift_conn(conn, shift_id) {
        Ok(Some(shift)) => {
            let has_note = shift
                .get("penyesuaian")
                .and_then(Value::as_array)
                .map(|notes| {
                    notes.iter().any(|n| {
                        n.get("transactionId").and_then(Value::as_str) == Some(transaction_id)
                    })
                })
                .unwrap_or(false);
            if !has_note {
                errors.push(format!(
                    "Shift {shift_id} has no adjustment note for transaction {transaction_id}"
                ));
            }
        }
        Ok(None) => errors.push(format!("Shift report not found: {shift_id}")),
        Err(e) => errors.push(format!("Failed to re-read shift report: {e}")),
    }

    // Audit entry must exist and carry its mandatory fields
    let audit_row = conn
        .query_row(
            "SELECT transaction_id, deleted_by, category, reason
             FROM critical_audit_log WHERE audit_id = ?1",
            params![audit_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .ok();

    match audit_row {
        Some((trx_id, deleted_by, category, reason)) => {
            for (field, value) in [
                ("transaction id", trx_id),
                ("deleted-by", deleted_by),
                ("category", category),
                ("reason", reason),
            ] {
                if value.unwrap_or_default().is_empty() {
                    errors.push(format!("Audit entry {audit_id} is missing its {field}"));
                }
            }
        }
        None => errors.push(format!("Audit entry {audit_id} not found")),
    }

    result(errors)
}

// ===========================================================================
// Tests
// ===========================================================================
