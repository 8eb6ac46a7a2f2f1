//! Mailboxes and the messages queued in them. A mailbox is a named bucket a
//! single worker drains; ids are lowercase and dot-namespaced by convention
//! (`newton.maxwell.bohr`) so wildcard searches stay intuitive.

use conduit_structs::ConduitError;
use regex::Regex;
use sqlx::SqlitePool;

use crate::deploys::Deployment;
use crate::{now_unix, storage_err};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub id: String,
    pub last_seen_at: Option<i64>,
    pub last_seen_host: String,
    pub last_seen_version: String,
}

/// One pending delivery. The body always comes from the owning deployment;
/// messages themselves only carry queue state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub mailbox: String,
    pub deployment: String,
    pub body: String,
    pub created_at: i64,
    pub receive_count: i64,
    pub last_received_at: Option<i64>,
    pub deleted: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStats {
    pub mailbox_count: i64,
    pub message_count: i64,
    pub pending_messages: i64,
}

/// Create a mailbox. Ids are lowercased; the id may not collide with an
/// existing mailbox or with an access-key name.
pub async fn create(pool: &SqlitePool, id: &str) -> Result<Mailbox, ConduitError> {
    let id = id.to_lowercase();
    if find(pool, &id).await?.is_some() {
        return Err(ConduitError::AlreadyExists(format!("mailbox '{id}'")));
    }
    if crate::access::exists(pool, &id).await? {
        return Err(ConduitError::NameCollision(id, "an access key"));
    }
    sqlx::query("INSERT INTO mailboxes (id) VALUES (?)")
        .bind(&id)
        .execute(pool)
        .await
        .map_err(storage_err)?;
    tracing::info!(mailbox = %id, "mailbox created");
    Ok(Mailbox {
        id,
        last_seen_at: None,
        last_seen_host: String::new(),
        last_seen_version: String::new(),
    })
}

pub async fn find(pool: &SqlitePool, id: &str) -> Result<Option<Mailbox>, ConduitError> {
    let row = sqlx::query_as::<_, (String, Option<i64>, String, String)>(
        "SELECT id, last_seen_at, last_seen_host, last_seen_version \
         FROM mailboxes WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(storage_err)?;
    Ok(row.map(mailbox_from_row))
}

pub async fn all(pool: &SqlitePool) -> Result<Vec<Mailbox>, ConduitError> {
    let rows = sqlx::query_as::<_, (String, Option<i64>, String, String)>(
        "SELECT id, last_seen_at, last_seen_host, last_seen_version \
         FROM mailboxes ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(storage_err)?;
    Ok(rows.into_iter().map(mailbox_from_row).collect())
}

/// Wildcard search over mailbox ids: `*` expands to `.*`, the whole id must
/// match, case-insensitively.
pub async fn search(pool: &SqlitePool, pattern: &str) -> Result<Vec<Mailbox>, ConduitError> {
    let regex = wildcard_regex(pattern)?;
    let mailboxes = all(pool).await?;
    Ok(mailboxes
        .into_iter()
        .filter(|mb| regex.is_match(&mb.id))
        .collect())
}

pub(crate) fn wildcard_regex(pattern: &str) -> Result<Regex, ConduitError> {
    let expanded = format!("(?i)^{}$", pattern.to_lowercase().replace('*', ".*"));
    Regex::new(&expanded).map_err(|_| ConduitError::Parse)
}

/// Remove a mailbox together with its messages and its bound access keys,
/// all in one transaction.
pub async fn deregister(pool: &SqlitePool, id: &str) -> Result<(), ConduitError> {
    let mailbox = find(pool, id)
        .await?
        .ok_or_else(|| ConduitError::not_found(format!("mailbox '{id}'")))?;
    let mut tx = pool.begin().await.map_err(storage_err)?;
    sqlx::query("DELETE FROM mailboxes WHERE id = ?")
        .bind(&mailbox.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
    sqlx::query("DELETE FROM messages WHERE mailbox = ?")
        .bind(&mailbox.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
    sqlx::query("DELETE FROM access_keys WHERE mailbox_id = ?")
        .bind(&mailbox.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
    tx.commit().await.map_err(storage_err)?;
    tracing::info!(mailbox = %mailbox.id, "mailbox deregistered");
    Ok(())
}

/// Record a worker check-in: when, from where, and which build.
pub async fn checkin(
    pool: &SqlitePool,
    id: &str,
    host: &str,
    version: &str,
) -> Result<(), ConduitError> {
    sqlx::query(
        "UPDATE mailboxes SET last_seen_at = ?, last_seen_host = ?, last_seen_version = ? \
         WHERE id = ?",
    )
    .bind(now_unix())
    .bind(host)
    .bind(version)
    .bind(id)
    .execute(pool)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Insert a new message for `deployment` into `mailbox` and bump the
/// deployment's fan-out counter, atomically.
pub async fn enqueue(
    pool: &SqlitePool,
    mailbox: &str,
    deployment: &Deployment,
) -> Result<Message, ConduitError> {
    let msg = Message {
        id: conduit_crypt::signature::new_identifier(),
        mailbox: mailbox.to_string(),
        deployment: deployment.id.clone(),
        body: deployment.message_body.clone(),
        created_at: now_unix(),
        receive_count: 0,
        last_received_at: None,
        deleted: false,
    };
    let mut tx = pool.begin().await.map_err(storage_err)?;
    sqlx::query(
        "INSERT INTO messages (id, mailbox, deployment, created_at, receive_count, deleted) \
         VALUES (?, ?, ?, ?, 0, 0)",
    )
    .bind(&msg.id)
    .bind(&msg.mailbox)
    .bind(&msg.deployment)
    .bind(msg.created_at)
    .execute(&mut *tx)
    .await
    .map_err(storage_err)?;
    sqlx::query("UPDATE deployments SET total_messages = total_messages + 1 WHERE id = ?")
        .bind(&msg.deployment)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
    tx.commit().await.map_err(storage_err)?;
    Ok(msg)
}

/// Pick one undeleted message from the mailbox, bump its receive count, and
/// return it. Ordering is unspecified, and the same message keeps coming
/// back until it is deleted; workers must tolerate replays.
pub async fn dequeue(pool: &SqlitePool, mailbox: &str) -> Result<Option<Message>, ConduitError> {
    let mut tx = pool.begin().await.map_err(storage_err)?;
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT m.id, m.mailbox, m.deployment, d.message_body, m.created_at, \
                m.receive_count, m.last_received_at, m.deleted \
         FROM messages m JOIN deployments d ON d.id = m.deployment \
         WHERE m.mailbox = ? AND m.deleted = 0 \
         LIMIT 1",
    )
    .bind(mailbox)
    .fetch_optional(&mut *tx)
    .await
    .map_err(storage_err)?;
    let Some(row) = row else {
        tx.commit().await.map_err(storage_err)?;
        return Ok(None);
    };
    let now = now_unix();
    sqlx::query("UPDATE messages SET receive_count = receive_count + 1, last_received_at = ? WHERE id = ?")
        .bind(now)
        .bind(&row.0)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
    tx.commit().await.map_err(storage_err)?;
    let mut msg = message_from_row(row);
    msg.receive_count += 1;
    msg.last_received_at = Some(now);
    Ok(Some(msg))
}

/// Look up a live (undeleted) message by id.
pub async fn find_message(pool: &SqlitePool, id: &str) -> Result<Option<Message>, ConduitError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT m.id, m.mailbox, m.deployment, d.message_body, m.created_at, \
                m.receive_count, m.last_received_at, m.deleted \
         FROM messages m JOIN deployments d ON d.id = m.deployment \
         WHERE m.id = ? AND m.deleted = 0 \
         LIMIT 1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(storage_err)?;
    Ok(row.map(message_from_row))
}

/// Mark a message deleted. Terminal and idempotent: deleting an already
/// deleted or unknown message succeeds.
pub async fn delete_message(pool: &SqlitePool, id: &str) -> Result<(), ConduitError> {
    sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(storage_err)?;
    Ok(())
}

/// Mark every message in the mailbox deleted; returns how many flipped.
pub async fn purge(pool: &SqlitePool, mailbox: &str) -> Result<u64, ConduitError> {
    let result = sqlx::query("UPDATE messages SET deleted = 1 WHERE mailbox = ? AND deleted = 0")
        .bind(mailbox)
        .execute(pool)
        .await
        .map_err(storage_err)?;
    Ok(result.rows_affected())
}

pub async fn pending_count(pool: &SqlitePool, mailbox: &str) -> Result<i64, ConduitError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT count(*) FROM messages WHERE mailbox = ? AND deleted = 0",
    )
    .bind(mailbox)
    .fetch_one(pool)
    .await
    .map_err(storage_err)
}

/// True while any undeleted message still references the asset; the GC keeps
/// the blob alive for exactly that long.
pub async fn asset_pending(pool: &SqlitePool, md5: &str) -> Result<bool, ConduitError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT count(m.id) FROM messages m JOIN deployments d ON d.id = m.deployment \
         WHERE m.deleted = 0 AND d.asset = ?",
    )
    .bind(md5)
    .fetch_one(pool)
    .await
    .map_err(storage_err)?;
    Ok(count != 0)
}

pub async fn stats(pool: &SqlitePool) -> Result<SystemStats, ConduitError> {
    let mailbox_count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM mailboxes")
        .fetch_one(pool)
        .await
        .map_err(storage_err)?;
    let message_count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM messages")
        .fetch_one(pool)
        .await
        .map_err(storage_err)?;
    let pending_messages =
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM messages WHERE deleted = 0")
            .fetch_one(pool)
            .await
            .map_err(storage_err)?;
    Ok(SystemStats {
        mailbox_count,
        message_count,
        pending_messages,
    })
}

type MessageRow = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    i64,
);

fn message_from_row(row: MessageRow) -> Message {
    let (id, mailbox, deployment, body, created_at, receive_count, last_received_at, deleted) = row;
    Message {
        id,
        mailbox,
        deployment,
        body,
        created_at,
        receive_count,
        last_received_at,
        deleted: deleted != 0,
    }
}

fn mailbox_from_row(row: (String, Option<i64>, String, String)) -> Mailbox {
    let (id, last_seen_at, last_seen_host, last_seen_version) = row;
    Mailbox {
        id,
        last_seen_at,
        last_seen_host,
        last_seen_version,
    }
}
