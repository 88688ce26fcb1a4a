//! Per-user daily quota on closed-shift transaction deletions.
//!
//! Every committed deletion appends a row to `deletion_rate_log`. Only
//! rows from the current calendar day count toward the quota; older rows
//! stay for the forensic trail but never block anyone. Users are tracked
//! independently.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::db::DbState;

/// At this many deletions in one day the caller gets a warning.
const WARNING_THRESHOLD: i64 = 5;
/// At this many deletions in one day further deletions are blocked.
const BLOCK_THRESHOLD: i64 = 10;

/// Number of deletions recorded for `username` on the current day.
pub(crate) fn get_deletion_count_today(conn: &Connection, username: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM deletion_rate_log
         WHERE username = ?1 AND date(created_at) = date('now')",
        params![username],
        |row| row.get(0),
    )
    .map_err(|e| format!("count deletions today: {e}"))
}

/// Append a dated entry to the user's deletion record.
///
/// Called only after the deletion committed; the caller runs this inside
/// the same transaction so a rollback removes the entry too.
pub(crate) fn record_deletion(
    conn: &Connection,
    username: &str,
    transaction_id: &str,
    audit_id: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO deletion_rate_log (username, transaction_id, audit_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![username, transaction_id, audit_id, Utc::now().to_rfc3339()],
    )
    .map_err(|e| format!("record deletion: {e}"))?;
    Ok(())
}

/// Check the user's deletion quota for today.
///
/// Returns `{allowed, level, count, message}` where level is `ok`,
/// `warning` (5 or more today) or `block` (10 or more today).
pub fn check_rate_limit(db: &DbState, username: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    check_rate_limit_conn(&conn, username)
}

/// Connection-level variant for callers already holding the lock.
pub(crate) fn check_rate_limit_conn(conn: &Connection, username: &str) -> Result<Value, String> {
    let count = get_deletion_count_today(conn, username)?;

    let result = if count >= BLOCK_THRESHOLD {
        serde_json::json!({
            "allowed": false,
            "level": "block",
            "count": count,
            "message": format!(
                "Daily maximum of {BLOCK_THRESHOLD} closed-shift deletions reached ({count} today). Try again tomorrow."
            ),
        })
    } else if count >= WARNING_THRESHOLD {
        serde_json::json!({
            "allowed": true,
            "level": "warning",
            "count": count,
            "message": format!(
                "{count} closed-shift deletions today; the warning threshold is {WARNING_THRESHOLD}. Deletions are blocked at {BLOCK_THRESHOLD}."
            ),
        })
    } else {
        serde_json::json!({
            "allowed": true,
            "level": "ok",
            "count": count,
        })
    };

    if count >= WARNING_THRESHOLD {
        info!(username = %username, count, "deletion quota pressure");
    }

    Ok(result)
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

    fn seed_entries(db: &DbState, username: &str, n: usize, created_at: &str) {
        let conn = db.conn.lock().unwrap();
        for i in 0..n {
            conn.execute(
                "INSERT INTO deletion_rate_log (username, transaction_id, audit_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    username,
                    format!("trx-{i}"),
                    format!("AUDIT-CLOSED-20240101-{:04}", i + 1),
                    created_at
                ],
            )
            .unwrap();
        }
    }

    #[test]
    fn under_five_is_ok() {
        let db = test_db();
        seed_entries(&db, "budi", 4, &Utc::now().to_rfc3339());

        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["allowed"], true);
        assert_eq!(r["level"], "ok");
        assert_eq!(r["count"], 4);
    }

    #[test]
    fn five_to_nine_warns_but_allows() {
        let db = test_db();
        seed_entries(&db, "budi", 5, &Utc::now().to_rfc3339());

        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["allowed"], true);
        assert_eq!(r["level"], "warning");
        assert!(r["message"].as_str().unwrap().contains('5'));

        seed_entries(&db, "budi", 4, &Utc::now().to_rfc3339());
        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["allowed"], true, "9 deletions still allowed");
        assert_eq!(r["level"], "warning");
    }

    #[test]
    fn ten_blocks() {
        let db = test_db();
        seed_entries(&db, "budi", 10, &Utc::now().to_rfc3339());

        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["allowed"], false);
        assert_eq!(r["level"], "block");
        assert!(r["message"].as_str().unwrap().contains("10"));
    }

    #[test]
    fn old_entries_do_not_count() {
        let db = test_db();
        // 30+ days old: excluded regardless of absolute count
        seed_entries(&db, "budi", 25, "2024-01-01T09:00:00+00:00");
        // Yesterday-ish is also excluded
        let yesterday = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        seed_entries(&db, "budi", 3, &yesterday);

        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["level"], "ok");
        assert_eq!(r["count"], 0);
    }

    #[test]
    fn users_are_tracked_independently() {
        let db = test_db();
        seed_entries(&db, "budi", 10, &Utc::now().to_rfc3339());

        let r = check_rate_limit(&db, "sari").unwrap();
        assert_eq!(r["allowed"], true);
        assert_eq!(r["level"], "ok");
        assert_eq!(r["count"], 0);
    }

    #[test]
    fn record_deletion_appends_dated_entry() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            record_deletion(&conn, "budi", "trx-1", "AUDIT-CLOSED-20260825-0001").unwrap();
        }

        let r = check_rate_limit(&db, "budi").unwrap();
        assert_eq!(r["count"], 1);
    }
}
