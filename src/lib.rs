//! Kasir POS - closed-shift transaction deletion core.
//!
//! A transaction that already landed in a closed shift report ("tutup
//! kasir") is frozen: its totals have been reported. Reversing one is an
//! exceptional, audited operation, not a CRUD delete. This crate implements
//! that workflow: authorization, re-authentication, rate limiting,
//! pre-validation, compensating shift adjustment, reversing double-entry
//! journals, post-validation, and an append-only critical audit log — all
//! inside a single SQLite transaction with rollback on any failure.
//!
//! Presentation (confirmation dialogs, dashboards) and the item-master UI
//! live with the caller; this crate exposes command-style functions that
//! take the shared [`db::DbState`] and JSON payloads.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod audit;
pub mod auth;
pub mod db;
pub mod deletion;
pub mod journal;
pub mod rate_limit;
pub mod shifts;
pub mod transactions;
pub mod validator;

/// Initialize structured logging (console + daily rolling file).
///
/// Call once at process start. The appender guard is leaked intentionally
/// so logs keep flushing until process exit.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kasir_pos_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "kasir");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    std::mem::forget(guard);

    info!("Kasir POS core v{}", env!("CARGO_PKG_VERSION"));
}

/// First non-empty string found under any of `keys`.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
