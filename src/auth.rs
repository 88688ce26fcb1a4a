//! Role checking and password re-verification with bcrypt.
//!
//! The deletion workflow requires the acting user to re-enter their
//! password even though they are already logged in. Failures are tracked
//! per user in the `password_attempts` table; the third consecutive wrong
//! password locks the account for five minutes. Unknown usernames are
//! never tracked.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: i64 = 3;
const LOCKOUT_MINUTES: i64 = 5;

// ---------------------------------------------------------------------------
// Role validation
// ---------------------------------------------------------------------------

/// True only for a non-null user whose `role` is exactly `administrator`.
///
/// Missing role field, any other role, or a null user all yield false.
/// Pure, no side effects.
pub fn is_super_admin(user: &Value) -> bool {
    user.get("role").and_then(Value::as_str) == Some("administrator")
}

// ---------------------------------------------------------------------------
// Lockout tracking
// ---------------------------------------------------------------------------

/// Per-user failure counter row.
struct AttemptRow {
    failed_attempts: i64,
    locked_until: Option<DateTime<Utc>>,
}

fn load_attempts(conn: &Connection, username: &str) -> AttemptRow {
    conn.query_row(
        "SELECT failed_attempts, locked_until FROM password_attempts WHERE username = ?1",
        params![username],
        |row| {
            let failed: i64 = row.get(0)?;
            let locked: Option<String> = row.get(1)?;
            Ok(AttemptRow {
                failed_attempts: failed,
                locked_until: locked
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        },
    )
    .unwrap_or(AttemptRow {
        failed_attempts: 0,
        locked_until: None,
    })
}

fn save_attempts(
    conn: &Connection,
    username: &str,
    failed_attempts: i64,
    locked_until: Option<&str>,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO password_attempts (username, failed_attempts, locked_until, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(username) DO UPDATE SET
            failed_attempts = excluded.failed_attempts,
            locked_until = excluded.locked_until,
            updated_at = excluded.updated_at",
        params![username, failed_attempts, locked_until],
    )
    .map_err(|e| format!("save password attempts: {e}"))?;
    Ok(())
}

/// Seconds remaining in an active lockout, 0 when not locked.
fn lockout_remaining_secs(row: &AttemptRow) -> i64 {
    match row.locked_until {
        Some(until) => {
            let left = until - Utc::now();
            left.num_seconds().max(0)
        }
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Password verification
// ---------------------------------------------------------------------------

/// Re-verify a user's password for a privileged operation.
///
/// Returns `{valid, message, remainingAttempts?}`. A locked-out user fails
/// regardless of password correctness and the blocked attempt is not
/// counted. An unknown username is reported but never tracked.
pub fn verify_password(db: &DbState, username: &str, password: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    verify_password_conn(&conn, username, password)
}

/// Connection-level variant for callers already holding the lock.
pub(crate) fn verify_password_conn(
    conn: &Connection,
    username: &str,
    password: &str,
) -> Result<Value, String> {
    let mut attempts = load_attempts(conn, username);

    // Active lockout blocks even a correct password
    let remaining = lockout_remaining_secs(&attempts);
    if remaining > 0 {
        warn!(username = %username, remaining_secs = remaining, "verification blocked by lockout");
        return Ok(serde_json::json!({
            "valid": false,
            "message": format!(
                "Account temporarily blocked. Try again in {remaining} second(s)."
            ),
        }));
    }

    // Expired lockout: clear stale tracking before counting this attempt
    if attempts.locked_until.is_some() {
        save_attempts(conn, username, 0, None)?;
        attempts.failed_attempts = 0;
        attempts.locked_until = None;
    }

    let hash: Option<String> = conn
        .query_row(
            "SELECT password_hash FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .ok();

    let Some(hash) = hash else {
        // Unknown users are not tracked
        return Ok(serde_json::json!({
            "valid": false,
            "message": "User not found",
        }));
    };

    if bcrypt::verify(password, &hash).unwrap_or(false) {
        save_attempts(conn, username, 0, None)?;
        info!(username = %username, "password re-verification successful");
        return Ok(serde_json::json!({
            "valid": true,
            "message": "Password verified",
        }));
    }

    let failures = attempts.failed_attempts + 1;
    let remaining_attempts = (MAX_FAILED_ATTEMPTS - failures).max(0);

    if failures >= MAX_FAILED_ATTEMPTS {
        let until = (Utc::now() + Duration::minutes(LOCKOUT_MINUTES)).to_rfc3339();
        save_attempts(conn, username, failures, Some(&until))?;
        warn!(username = %username, failures, "lockout engaged after repeated failures");
        return Ok(serde_json::json!({
            "valid": false,
            "message": format!(
                "Too many failed attempts. Account blocked for {LOCKOUT_MINUTES} minute(s)."
            ),
            "remainingAttempts": 0,
        }));
    }

    save_attempts(conn, username, failures, None)?;
    warn!(username = %username, failures, "wrong password");
    Ok(serde_json::json!({
        "valid": false,
        "message": format!("Invalid password. {remaining_attempts} attempt(s) remaining."),
        "remainingAttempts": remaining_attempts,
    }))
}

/// Report whether a user is currently locked out.
///
/// `remainingTime` is seconds left in an active lockout, 0 otherwise.
pub fn is_blocked(db: &DbState, username: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let attempts = load_attempts(&conn, username);
    let remaining = lockout_remaining_secs(&attempts);
    Ok(serde_json::json!({
        "blocked": remaining > 0,
        "remainingTime": remaining,
    }))
}

/// Manually clear failure tracking for a user (admin unlock).
pub fn reset_failed_attempts(db: &DbState, username: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "DELETE FROM password_attempts WHERE username = ?1",
        params![username],
    )
    .map_err(|e| format!("reset attempts: {e}"))?;
    info!(username = %username, "failed-attempt tracking reset");
    Ok(serde_json::json!({ "success": true }))
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

    fn seed_user(db: &DbState, username: &str, password: &str, role: &str) {
        let conn = db.conn.lock().unwrap();
        let hash = bcrypt::hash(password, 4).expect("hash test password");
        conn.execute(
            "INSERT INTO users (id, username, nama, role, password_hash)
             VALUES (?1, ?1, ?1, ?2, ?3)",
            params![username, role, hash],
        )
        .expect("insert user");
    }

    #[test]
    fn super_admin_requires_administrator_role() {
        assert!(is_super_admin(&serde_json::json!({ "role": "administrator" })));
        assert!(!is_super_admin(&serde_json::json!({ "role": "kasir" })));
        assert!(!is_super_admin(&serde_json::json!({ "role": "admin" })));
        assert!(!is_super_admin(&serde_json::json!({ "name": "budi" })));
        assert!(!is_super_admin(&Value::Null));
    }

    #[test]
    fn correct_password_verifies_and_clears_counter() {
        let db = test_db();
        seed_user(&db, "budi", "rahasia-123", "administrator");

        // One failure first
        let r = verify_password(&db, "budi", "salah").unwrap();
        assert_eq!(r["valid"], false);
        assert_eq!(r["remainingAttempts"], 2);

        let r = verify_password(&db, "budi", "rahasia-123").unwrap();
        assert_eq!(r["valid"], true);

        // Counter cleared: a new failure starts from 3 attempts again
        let r = verify_password(&db, "budi", "salah").unwrap();
        assert_eq!(r["remainingAttempts"], 2);
    }

    #[test]
    fn third_failure_locks_for_five_minutes() {
        let db = test_db();
        seed_user(&db, "sari", "benar-sekali-99", "kasir");

        for expected_remaining in [2, 1] {
            let r = verify_password(&db, "sari", "salah").unwrap();
            assert_eq!(r["valid"], false);
            assert_eq!(r["remainingAttempts"], expected_remaining);
        }

        let r = verify_password(&db, "sari", "salah").unwrap();
        assert_eq!(r["valid"], false);
        assert_eq!(r["remainingAttempts"], 0);

        let b = is_blocked(&db, "sari").unwrap();
        assert_eq!(b["blocked"], true);
        let remaining = b["remainingTime"].as_i64().unwrap();
        assert!(remaining > 0 && remaining <= 300, "remaining={remaining}");

        // Correct password still fails during lockout
        let r = verify_password(&db, "sari", "benar-sekali-99").unwrap();
        assert_eq!(r["valid"], false);
        assert!(r["message"].as_str().unwrap().contains("blocked"));
    }

    #[test]
    fn unknown_user_is_not_tracked() {
        let db = test_db();

        let r = verify_password(&db, "hantu", "apapun").unwrap();
        assert_eq!(r["valid"], false);
        assert_eq!(r["message"], "User not found");

        let conn = db.conn.lock().unwrap();
        let tracked: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM password_attempts WHERE username = 'hantu'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tracked, 0);
    }

    #[test]
    fn reset_clears_lockout() {
        let db = test_db();
        seed_user(&db, "tono", "password-panjang", "kasir");

        for _ in 0..3 {
            verify_password(&db, "tono", "salah").unwrap();
        }
        assert_eq!(is_blocked(&db, "tono").unwrap()["blocked"], true);

        reset_failed_attempts(&db, "tono").unwrap();
        assert_eq!(is_blocked(&db, "tono").unwrap()["blocked"], false);

        let r = verify_password(&db, "tono", "password-panjang").unwrap();
        assert_eq!(r["valid"], true);
    }

    #[test]
    fn expired_lockout_clears_stale_counter() {
        let db = test_db();
        seed_user(&db, "lina", "sandi-aman-7", "kasir");

        // Simulate a lockout that already expired
        {
            let conn = db.conn.lock().unwrap();
            let past = (Utc::now() - Duration::minutes(10)).to_rfc3339();
            conn.execute(
                "INSERT INTO password_attempts (username, failed_attempts, locked_until)
                 VALUES ('lina', 3, ?1)",
                params![past],
            )
            .unwrap();
        }

        assert_eq!(is_blocked(&db, "lina").unwrap()["blocked"], false);

        // Attempt counts fresh after expiry
        let r = verify_password(&db, "lina", "salah").unwrap();
        assert_eq!(r["remainingAttempts"], 2);
    }
}
