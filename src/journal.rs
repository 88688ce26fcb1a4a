//! Compensating double-entry journal records for deleted transactions.
//!
//! A deletion produces one or two balanced records tagged
//! `CLOSED_SHIFT_REVERSAL`, dated at deletion time — never at the
//! original transaction date, so the reversal lands in the current
//! accounting period:
//!
//! - revenue reversal (always): debit Penjualan, credit Kas (cash sale)
//!   or Piutang (bon sale)
//! - cost-of-goods reversal (only when the summed line cost is positive):
//!   debit Persediaan, credit HPP
//!
//! Every referenced account must exist in `chart_of_accounts`; a missing
//! account fails the build, which aborts and rolls back the deletion.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

/// Tag carried by every reversal record from this workflow.
pub const REVERSAL_TAG: &str = "CLOSED_SHIFT_REVERSAL";

pub(crate) const ACCOUNT_KAS: &str = "1-1000";
pub(crate) const ACCOUNT_PIUTANG: &str = "1-1200";
pub(crate) const ACCOUNT_PERSEDIAAN: &str = "1-1300";
pub(crate) const ACCOUNT_PENJUALAN: &str = "4-1000";
pub(crate) const ACCOUNT_HPP: &str = "5-1000";

/// Fail unless the account code exists in the chart of accounts.
fn require_account(conn: &Connection, kode: &str) -> Result<(), String> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM chart_of_accounts WHERE kode = ?1",
            params![kode],
            |row| row.get(0),
        )
        .map_err(|e| format!("read chart of accounts: {e}"))?;
    if count == 0 {
        return Err(format!("Account {kode} missing from chart of accounts"));
    }
    Ok(())
}

/// Summed line cost (`qty * hpp`) of a transaction.
fn total_hpp(transaction: &Value) -> f64 {
    transaction
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let qty = item.get("qty").and_then(Value::as_f64).unwrap_or(0.0);
                    let hpp = item.get("hpp").and_then(Value::as_f64).unwrap_or(0.0);
                    qty * hpp
                })
                .sum()
        })
        .unwrap_or(0.0)
}

fn entry(deskripsi: String, tanggal: &str, lines: Value) -> Value {
    serde_json::json!({
        "id": Uuid::new_v4().to_string(),
        "deskripsi": deskripsi,
        "tanggal": tanggal,
        "tag": REVERSAL_TAG,
        "lines": lines,
    })
}

/// Build the reversing journal records for a deleted transaction.
///
/// The records are not persisted here; the orchestrator persists them
/// inside its transaction via [`persist_entries`].
pub(crate) fn build_reversal_entries(
    conn: &Connection,
    transaction: &Value,
) -> Result<Vec<Value>, String> {
    let total = transaction.get("total").and_then(Value::as_f64).unwrap_or(0.0);
    let metode = transaction
        .get("metode")
        .and_then(Value::as_str)
        .unwrap_or("cash");
    let nomor = transaction.get("nomor").and_then(Value::as_str).unwrap_or("");
    let now = Utc::now().to_rfc3339();

    let counter_account = if metode == "cash" {
        ACCOUNT_KAS
    } else {
        ACCOUNT_PIUTANG
    };
    require_account(conn, ACCOUNT_PENJUALAN)?;
    require_account(conn, counter_account)?;

    let mut entries = vec![entry(
        format!("Pembalikan penjualan {nomor} (hapus transaksi shift tertutup)"),
        &now,
        serde_json::json!([
            { "account": ACCOUNT_PENJUALAN, "debit": total, "credit": 0.0 },
            { "account": counter_account, "debit": 0.0, "credit": total },
        ]),
    )];

    let cost = total_hpp(transaction);
    if cost > 0.0 {
        require_account(conn, ACCOUNT_PERSEDIAAN)?;
        require_account(conn, ACCOUNT_HPP)?;
        entries.push(entry(
            format!("Pembalikan HPP {nomor} (hapus transaksi shift tertutup)"),
            &now,
            serde_json::json!([
                { "account": ACCOUNT_PERSEDIAAN, "debit": cost, "credit": 0.0 },
                { "account": ACCOUNT_HPP, "debit": 0.0, "credit": cost },
            ]),
        ));
    }

    Ok(entries)
}

/// Insert the built records into `jurnal`.
pub(crate) fn persist_entries(conn: &Connection, entries: &[Value]) -> Result<(), String> {
    for e in entries {
        let lines_raw = serde_json::to_string(&e["lines"])
            .map_err(|err| format!("serialize journal lines: {err}"))?;
        conn.execute(
            "INSERT INTO jurnal (id, deskripsi, tanggal, tag, lines)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                e["id"].as_str().unwrap_or_default(),
                e["deskripsi"].as_str().unwrap_or_default(),
                e["tanggal"].as_str().unwrap_or_default(),
                e["tag"].as_str().unwrap_or_default(),
                lines_raw,
            ],
        )
        .map_err(|err| format!("insert journal record: {err}"))?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    fn transaction(metode: &str, total: f64, items: Value) -> Value {
        serde_json::json!({
            "id": "t1",
            "nomor": "TRX-001",
            "tanggal": "2025-01-15T09:00:00+00:00",
            "total": total,
            "metode": metode,
            "items": items,
        })
    }

    fn lines_balanced(entry: &Value) -> bool {
        let lines = entry["lines"].as_array().unwrap();
        let debit: f64 = lines.iter().map(|l| l["debit"].as_f64().unwrap()).sum();
        let credit: f64 = lines.iter().map(|l| l["credit"].as_f64().unwrap()).sum();
        (debit - credit).abs() < 0.001
    }

    #[test]
    fn cash_sale_credits_kas() {
        let conn = test_conn();
        let trx = transaction(
            "cash",
            50000.0,
            serde_json::json!([{"id":"b1","qty":2,"harga":25000,"hpp":15000}]),
        );

        let entries = build_reversal_entries(&conn, &trx).unwrap();
        assert_eq!(entries.len(), 2);

        let revenue = &entries[0];
        assert_eq!(revenue["tag"], REVERSAL_TAG);
        assert_eq!(revenue["lines"][0]["account"], ACCOUNT_PENJUALAN);
        assert_eq!(revenue["lines"][0]["debit"], 50000.0);
        assert_eq!(revenue["lines"][1]["account"], ACCOUNT_KAS);
        assert_eq!(revenue["lines"][1]["credit"], 50000.0);
        assert!(lines_balanced(revenue));

        let cost = &entries[1];
        assert_eq!(cost["lines"][0]["account"], ACCOUNT_PERSEDIAAN);
        assert_eq!(cost["lines"][0]["debit"], 30000.0);
        assert_eq!(cost["lines"][1]["account"], ACCOUNT_HPP);
        assert_eq!(cost["lines"][1]["credit"], 30000.0);
        assert!(lines_balanced(cost));
    }

    #[test]
    fn bon_sale_credits_piutang() {
        let conn = test_conn();
        let trx = transaction("bon", 75000.0, serde_json::json!([]));

        let entries = build_reversal_entries(&conn, &trx).unwrap();
        assert_eq!(entries[0]["lines"][1]["account"], ACCOUNT_PIUTANG);
        assert_eq!(entries[0]["lines"][1]["credit"], 75000.0);
    }

    #[test]
    fn zero_cost_omits_hpp_record() {
        let conn = test_conn();
        let trx = transaction(
            "cash",
            10000.0,
            serde_json::json!([{"id":"b1","qty":2,"harga":5000,"hpp":0}]),
        );

        let entries = build_reversal_entries(&conn, &trx).unwrap();
        assert_eq!(entries.len(), 1, "cost record omitted when sum(qty*hpp) == 0");
    }

    #[test]
    fn reversal_dated_at_deletion_time_not_transaction_date() {
        let conn = test_conn();
        let trx = transaction("cash", 10000.0, serde_json::json!([]));

        let entries = build_reversal_entries(&conn, &trx).unwrap();
        let tanggal = entries[0]["tanggal"].as_str().unwrap();
        assert_ne!(tanggal, "2025-01-15T09:00:00+00:00");
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(tanggal.starts_with(&today), "got {tanggal}");
    }

    #[test]
    fn missing_account_fails_build() {
        let conn = test_conn();
        conn.execute("DELETE FROM chart_of_accounts WHERE kode = '4-1000'", [])
            .unwrap();

        let trx = transaction("cash", 10000.0, serde_json::json!([]));
        let err = build_reversal_entries(&conn, &trx).unwrap_err();
        assert!(err.contains("4-1000"));
    }

    #[test]
    fn persist_writes_rows() {
        let conn = test_conn();
        let trx = transaction(
            "cash",
            50000.0,
            serde_json::json!([{"id":"b1","qty":1,"hpp":20000}]),
        );

        let entries = build_reversal_entries(&conn, &trx).unwrap();
        persist_entries(&conn, &entries).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM jurnal WHERE tag = ?1",
                params![REVERSAL_TAG],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
