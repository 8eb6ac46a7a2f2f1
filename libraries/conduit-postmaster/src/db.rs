use std::path::Path;
use std::time::Duration;

use conduit_structs::ConduitError;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};

use crate::storage_err;

/// Per-version schema scripts. The `properties.dbversion` key records how
/// many of these have been applied; each runs once, inside its own
/// transaction, in order. Scripts must stay idempotent so a crash between
/// the script and the version bump is harmless on the next open.
const MIGRATIONS: &[&str] = &[SCHEMA_V1, SCHEMA_V2];

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS mailboxes (
    id                TEXT PRIMARY KEY,
    last_seen_at      INTEGER,
    last_seen_host    TEXT NOT NULL DEFAULT '',
    last_seen_version TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS access_keys (
    name        TEXT PRIMARY KEY,
    secret      TEXT NOT NULL,
    full_access INTEGER NOT NULL,
    mailbox_id  TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS deployments (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    deployed_by    TEXT NOT NULL,
    deployed_at    INTEGER NOT NULL,
    message_body   TEXT NOT NULL,
    asset          TEXT NOT NULL DEFAULT '',
    total_messages INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY,
    mailbox          TEXT NOT NULL,
    deployment       TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    receive_count    INTEGER NOT NULL DEFAULT 0,
    last_received_at INTEGER,
    deleted          INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS deployment_responses (
    deployment   TEXT NOT NULL,
    mailbox      TEXT NOT NULL,
    response     TEXT NOT NULL,
    is_error     INTEGER NOT NULL,
    responded_at INTEGER NOT NULL
);
";

const SCHEMA_V2: &str = "
CREATE INDEX IF NOT EXISTS idx_messages_mailbox ON messages (mailbox, deleted);
CREATE INDEX IF NOT EXISTS idx_messages_deployment ON messages (deployment, deleted);
CREATE INDEX IF NOT EXISTS idx_responses_deployment ON deployment_responses (deployment);
";

/// Open (creating if missing) the broker database and bring its schema up to
/// date.
pub async fn open(path: &Path) -> Result<SqlitePool, ConduitError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal);
    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(storage_err)?;
    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests. Pinned to a single connection: every new
/// sqlite `:memory:` connection is a fresh empty database.
pub async fn open_memory() -> Result<SqlitePool, ConduitError> {
    let options = SqliteConnectOptions::new().in_memory(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(storage_err)?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply every schema script above the stored `dbversion`, advancing the
/// property as each lands. Forward-only.
pub async fn migrate(pool: &SqlitePool) -> Result<(), ConduitError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS properties (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(storage_err)?;
    let mut version = db_version(pool).await?;
    while (version as usize) < MIGRATIONS.len() {
        let mut tx = pool.begin().await.map_err(storage_err)?;
        sqlx::raw_sql(MIGRATIONS[version as usize])
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        version += 1;
        sqlx::query(
            "INSERT INTO properties (key, value) VALUES ('dbversion', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(version.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        tracing::info!(version, "database schema migrated");
    }
    Ok(())
}

/// The stored schema version; 0 on a fresh database.
pub async fn db_version(pool: &SqlitePool) -> Result<i64, ConduitError> {
    let row =
        sqlx::query_scalar::<_, String>("SELECT value FROM properties WHERE key = 'dbversion'")
            .fetch_optional(pool)
            .await
            .map_err(storage_err)?;
    Ok(row.and_then(|v| v.parse().ok()).unwrap_or(0))
}
