//! The broker core: durable mailbox and deployment storage, access keys,
//! content-addressed asset files, the long-poll rendezvous hub, and the HTTP
//! surface that ties them together.
//!
//! Everything stateful hangs off a [`sqlx::SqlitePool`]; the modules here are
//! free async functions over that pool so the CLI's local administration
//! commands, the HTTP handlers, and the tests all share one code path.

pub mod access;
pub mod assets;
pub mod db;
pub mod deploys;
pub mod longpoll;
pub mod mailboxes;
pub mod server;

use conduit_structs::ConduitError;

/// Map a storage-layer failure into the uniform error kind, logging the
/// detail server-side so the HTTP boundary can stay terse.
pub(crate) fn storage_err(err: impl std::fmt::Display) -> ConduitError {
    tracing::error!(error = %err, "storage error");
    ConduitError::io(err)
}

/// Current time as unix seconds, the storage representation for every
/// timestamp column.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Render a stored unix-seconds timestamp as RFC3339 for the wire.
pub(crate) fn unix_to_rfc3339(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}
