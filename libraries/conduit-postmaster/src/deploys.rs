//! Deployments: one admin-initiated broadcast, fanned out as one message per
//! targeted mailbox, with append-only response collection.

use std::time::Duration;

use conduit_structs::ConduitError;
use sqlx::SqlitePool;

use crate::longpoll::PollHub;
use crate::mailboxes::{self, wildcard_regex};
use crate::{now_unix, storage_err};

/// Enqueue commits become visible to the worker's follow-up queries before
/// the live long-poll delivery fires.
const SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub deployed_by: String,
    pub deployed_at: i64,
    /// Immutable after creation; every fanned-out message inherits it.
    pub message_body: String,
    pub asset: String,
    pub total_messages: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseRow {
    pub deployment: String,
    pub mailbox: String,
    pub response: String,
    pub is_error: bool,
    pub responded_at: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeploymentStats {
    pub message_count: i64,
    pub pending_count: i64,
    pub response_count: i64,
}

/// Persist a new deployment. The name defaults to the generated id.
pub async fn create(
    pool: &SqlitePool,
    body: &str,
    asset: &str,
    name: &str,
    deployed_by: &str,
) -> Result<Deployment, ConduitError> {
    let id = conduit_crypt::signature::new_identifier();
    let dep = Deployment {
        name: if name.is_empty() { id.clone() } else { name.to_string() },
        id,
        deployed_by: deployed_by.to_string(),
        deployed_at: now_unix(),
        message_body: body.to_string(),
        asset: asset.to_string(),
        total_messages: 0,
    };
    sqlx::query(
        "INSERT INTO deployments (id, name, deployed_by, deployed_at, message_body, asset, total_messages) \
         VALUES (?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(&dep.id)
    .bind(&dep.name)
    .bind(&dep.deployed_by)
    .bind(dep.deployed_at)
    .bind(&dep.message_body)
    .bind(&dep.asset)
    .execute(pool)
    .await
    .map_err(storage_err)?;
    Ok(dep)
}

pub async fn find(pool: &SqlitePool, id: &str) -> Result<Option<Deployment>, ConduitError> {
    let row = sqlx::query_as::<_, DeploymentRow>(
        "SELECT id, name, deployed_by, deployed_at, message_body, asset, total_messages \
         FROM deployments WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(storage_err)?;
    Ok(row.map(deployment_from_row))
}

/// Fan the deployment out to every listed mailbox and wake any parked long
/// poll. Each enqueue commits before its delivery is scheduled, so a worker
/// woken live will find the message persisted.
pub async fn deploy_to(
    pool: &SqlitePool,
    hub: &PollHub,
    dep: &Deployment,
    targets: &[String],
) -> Result<Vec<String>, ConduitError> {
    let mut delivered = Vec::with_capacity(targets.len());
    for mailbox in targets {
        let msg = mailboxes::enqueue(pool, mailbox, dep).await?;
        delivered.push(mailbox.clone());
        let hub = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            let mailbox = msg.mailbox.clone();
            hub.publish(&mailbox, msg);
        });
    }
    tracing::info!(
        deployment = %dep.id,
        deployed_by = %dep.deployed_by,
        mailboxes = delivered.len(),
        "deployment fanned out"
    );
    Ok(delivered)
}

/// Append a worker response. A script may respond any number of times per
/// message; nothing deduplicates.
pub async fn add_response(
    pool: &SqlitePool,
    deployment: &str,
    mailbox: &str,
    response: &str,
    is_error: bool,
) -> Result<(), ConduitError> {
    sqlx::query(
        "INSERT INTO deployment_responses (deployment, mailbox, response, is_error, responded_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(deployment)
    .bind(mailbox)
    .bind(response)
    .bind(i64::from(is_error))
    .bind(now_unix())
    .execute(pool)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Recent deployments, newest first, filtered by wildcard patterns over the
/// deployment name and the deploying key name. Empty patterns match all.
pub async fn list(
    pool: &SqlitePool,
    name_pattern: &str,
    key_name_pattern: &str,
    limit: i64,
) -> Result<Vec<Deployment>, ConduitError> {
    let name_re = wildcard_regex(if name_pattern.is_empty() { "*" } else { name_pattern })?;
    let key_re = wildcard_regex(if key_name_pattern.is_empty() { "*" } else { key_name_pattern })?;
    let limit = if limit <= 0 { 10 } else { limit } as usize;
    let rows = sqlx::query_as::<_, DeploymentRow>(
        "SELECT id, name, deployed_by, deployed_at, message_body, asset, total_messages \
         FROM deployments ORDER BY deployed_at DESC, id",
    )
    .fetch_all(pool)
    .await
    .map_err(storage_err)?;
    Ok(rows
        .into_iter()
        .map(deployment_from_row)
        .filter(|dep| name_re.is_match(&dep.name) && key_re.is_match(&dep.deployed_by))
        .take(limit)
        .collect())
}

pub async fn stats(pool: &SqlitePool, id: &str) -> Result<DeploymentStats, ConduitError> {
    let message_count =
        sqlx::query_scalar::<_, i64>("SELECT total_messages FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(storage_err)?
            .unwrap_or(0);
    let pending_count = sqlx::query_scalar::<_, i64>(
        "SELECT count(*) FROM messages WHERE deployment = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .map_err(storage_err)?;
    let response_count =
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM deployment_responses WHERE deployment = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(storage_err)?;
    Ok(DeploymentStats {
        message_count,
        pending_count,
        response_count,
    })
}

/// Every response for a deployment, sorted by mailbox.
pub async fn responses(pool: &SqlitePool, id: &str) -> Result<Vec<ResponseRow>, ConduitError> {
    let rows = sqlx::query_as::<_, (String, String, String, i64, i64)>(
        "SELECT deployment, mailbox, response, is_error, responded_at \
         FROM deployment_responses WHERE deployment = ? ORDER BY mailbox",
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .map_err(storage_err)?;
    Ok(rows
        .into_iter()
        .map(|(deployment, mailbox, response, is_error, responded_at)| ResponseRow {
            deployment,
            mailbox,
            response,
            is_error: is_error != 0,
            responded_at,
        })
        .collect())
}

type DeploymentRow = (String, String, String, i64, String, String, i64);

fn deployment_from_row(row: DeploymentRow) -> Deployment {
    let (id, name, deployed_by, deployed_at, message_body, asset, total_messages) = row;
    Deployment {
        id,
        name,
        deployed_by,
        deployed_at,
        message_body,
        asset,
        total_messages,
    }
}
