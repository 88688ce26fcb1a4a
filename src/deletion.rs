//! Orchestrator for deleting a transaction from a closed shift.
//!
//! Sequence: authorize → authenticate → rate check → pre-validate →
//! snapshot → mutate → post-validate → audit → commit. All writes (the
//! transaction delete, stock restoration, shift adjustment, reversal
//! journals, the audit entry, and the rate-limit entry) happen inside one
//! `BEGIN IMMEDIATE` transaction; post-validation runs before COMMIT so a
//! failure rolls everything back, including the audit entry.
//!
//! Every failure path returns a structured JSON result with `message` and
//! `level`; business failures are never surfaced as `Err`.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;
use crate::{auth, audit, journal, rate_limit, shifts, transactions, validator, value_str};

/// Accepted deletion categories, as presented by the reason dialog.
const CATEGORIES: &[&str] = &[
    "Kesalahan Input",
    "Transaksi Duplikat",
    "Fraud",
    "Koreksi Akuntansi",
    "Lainnya",
];

const REASON_MIN_CHARS: usize = 20;
const REASON_MAX_CHARS: usize = 1000;

fn fail(message: impl Into<String>, level: &str) -> Value {
    serde_json::json!({
        "success": false,
        "message": message.into(),
        "level": level,
    })
}

fn joined_errors(validation: &Value) -> String {
    validation["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}

/// Delete a transaction that already landed in a closed shift report.
///
/// `request = {category, reason, username, password, user}`. Returns
/// `{success, auditId?, message?, level?, warnings?}`.
pub fn delete_closed_transaction(
    db: &DbState,
    transaction_id: &str,
    request: &Value,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // --- Authorizing -------------------------------------------------------
    let null_user = Value::Null;
    let user = request.get("user").unwrap_or(&null_user);
    if !auth::is_super_admin(user) {
        warn!(transaction_id = %transaction_id, "deletion rejected: not a super admin");
        return Ok(fail(
            "Only a super admin (administrator) can delete a closed-shift transaction",
            "unauthorized",
        ));
    }

    let Some(category) = value_str(request, &["category"]) else {
        return Ok(fail("Missing deletion category", "validation"));
    };
    if !CATEGORIES.contains(&category.as_str()) {
        return Ok(fail(
            format!("Invalid deletion category: {category}"),
            "validation",
        ));
    }
    let reason = value_str(request, &["reason"]).unwrap_or_default();
    let reason_chars = reason.chars().count();
    if reason_chars < REASON_MIN_CHARS || reason_chars > REASON_MAX_CHARS {
        return Ok(fail(
            format!("Reason must be {REASON_MIN_CHARS}-{REASON_MAX_CHARS} characters"),
            "validation",
        ));
    }
    let Some(username) = value_str(request, &["username"]) else {
        return Ok(fail("Missing username", "validation"));
    };
    let password = request.get("password").and_then(Value::as_str).unwrap_or("");

    // --- Authenticating ----------------------------------------------------
    let verification = auth::verify_password_conn(&conn, &username, password)?;
    if !verification["valid"].as_bool().unwrap_or(false) {
        let message = verification["message"].as_str().unwrap_or("Password verification failed");
        return Ok(fail(message, "auth"));
    }
    let password_verified_at = Utc::now().to_rfc3339();

    // --- RateChecking ------------------------------------------------------
    let rate = rate_limit::check_rate_limit_conn(&conn, &username)?;
    let mut warnings: Vec<Value> = Vec::new();
    if !rate["allowed"].as_bool().unwrap_or(false) {
        let message = rate["message"].as_str().unwrap_or("Daily deletion limit reached");
        return Ok(fail(message, "block"));
    }
    if rate["level"] == "warning" {
        warnings.push(rate["message"].clone());
    }

    // --- PreValidating -----------------------------------------------------
    let pre = validator::pre_delete_validation(&conn, transaction_id);
    if !pre["valid"].as_bool().unwrap_or(false) {
        return Ok(fail(joined_errors(&pre), "validation"));
    }

    // --- Snapshot ----------------------------------------------------------
    // Owned JSON copies: nothing here shares state with the store.
    let Some(trx) = transactions::get_transaction_conn(&conn, transaction_id)? else {
        return Ok(fail(format!("Transaction {transaction_id} not found"), "validation"));
    };
    let Some(shift) = shifts::identify_shift(&conn, &trx)? else {
        return Ok(fail(
            format!("No shift report matches transaction {transaction_id}"),
            "validation",
        ));
    };
    let shift_id = shift["id"].as_str().unwrap_or_default().to_string();

    // --- Mutating ----------------------------------------------------------
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<String, String> {
        let deleted = conn
            .execute(
                "DELETE FROM transaksi WHERE id = ?1",
                rusqlite::params![transaction_id],
            )
            .map_err(|e| format!("delete transaction: {e}"))?;
        if deleted == 0 {
            return Err(format!("Transaction {transaction_id} vanished before deletion"));
        }

        transactions::restore_stock(&conn, &trx["items"])?;

        let adjust = shifts::adjust_tutup_kasir(&conn, &trx, &shift_id)?;
        let adjustment = &adjust["adjustmentData"];

        let entries = journal::build_reversal_entries(&conn, &trx)?;
        journal::persist_entries(&conn, &entries)?;

        let journal_lines: Vec<Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "deskripsi": e["deskripsi"],
                    "tanggal": e["tanggal"],
                    "tag": e["tag"],
                    "lines": e["lines"],
                })
            })
            .collect();

        // --- Logging (inside the transaction: rollback leaves no trace) ----
        let audit_data = serde_json::json!({
            "transactionId": transaction_id,
            "transactionNo": trx["nomor"],
            "category": category.clone(),
            "reason": reason,
            "deletedBy": username.clone(),
            "passwordVerifiedAt": password_verified_at,
            "transactionSnapshot": trx,
            "shiftBefore": adjustment["snapshotBefore"],
            "shiftAfter": adjustment["snapshotAfter"],
            "journalLines": journal_lines,
            "adjustmentRef": adjustment["adjustmentNote"]["reference"],
            "validationResults": { "preDeletion": pre },
            "stockRestored": true,
            "warnings": warnings.clone(),
        });
        let audit_id = audit::log_critical_deletion(&conn, &audit_data)?;

        rate_limit::record_deletion(&conn, &username, transaction_id, &audit_id)?;

        // --- PostValidating -------------------------------------------------
        let ctx = serde_json::json!({
            "transactionId": transaction_id,
            "shiftId": shift_id,
            "auditId": audit_id.clone(),
            "stockRestored": true,
            "journalEntries": entries,
        });
        let post = validator::post_delete_validation(&conn, &ctx);
        if !post["valid"].as_bool().unwrap_or(false) {
            return Err(format!(
                "Post-deletion validation failed: {}",
                joined_errors(&post)
            ));
        }

        Ok(audit_id)
    })();

    // --- Commit / RollingBack ----------------------------------------------
    let audit_id = match result {
        Ok(audit_id) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                warn!(transaction_id = %transaction_id, "commit failed: {e}");
                return Ok(fail(format!("commit: {e}"), "rollback"));
            }
            audit_id
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!(
                transaction_id = %transaction_id,
                username = %username,
                "deletion rolled back: {e}"
            );
            return Ok(fail(e, "rollback"));
        }
    };

    info!(
        transaction_id = %transaction_id,
        audit_id = %audit_id,
        username = %username,
        category = %category,
        "closed-shift transaction deleted"
    );

    Ok(serde_json::json!({
        "success": true,
        "auditId": audit_id,
        "message": "Closed-shift transaction deleted",
        "warnings": warnings,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
