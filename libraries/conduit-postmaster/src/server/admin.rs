//! Administrative endpoints: mailbox lifecycle, deployment inspection, and
//! broker metrics. All of these require a full-access key.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use conduit_structs::{
    ClientStatus, ClientStatusResponse, ConduitError, DeploymentResponse, DeploymentStats,
    DeploymentStatsRequest, DeploymentStatsResponse, RegisterRequest, RegisterResponse, Signed,
    SimpleRequest, SimpleResponse, SystemStatsResponse,
};

use super::{BrokerState, authenticate, decode, error_response, json_response};
use crate::{access, db, deploys, mailboxes, unix_to_rfc3339};

pub(super) async fn register(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<RegisterRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_register(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_register(
    state: &BrokerState,
    req: RegisterRequest,
) -> Result<RegisterResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_admin() {
        return Err(ConduitError::Unauthorized("register mailboxes"));
    }
    let mailbox = mailboxes::create(&state.pool, &req.mailbox).await?;
    let mailbox_key = access::create_for_mailbox(&state.pool, &mailbox.id).await?;
    let mut resp = RegisterResponse {
        mailbox: mailbox.id,
        access_key_name: mailbox_key.name,
        access_key_secret: mailbox_key.secret,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn deregister(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<RegisterRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_deregister(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_deregister(
    state: &BrokerState,
    req: RegisterRequest,
) -> Result<SimpleResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_admin() {
        return Err(ConduitError::Unauthorized("deregister mailboxes"));
    }
    mailboxes::deregister(&state.pool, &req.mailbox).await?;
    let mut resp = SimpleResponse {
        success: true,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn deploy_info(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<DeploymentStatsRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_deploy_info(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_deploy_info(
    state: &BrokerState,
    req: DeploymentStatsRequest,
) -> Result<DeploymentStatsResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_admin() {
        return Err(ConduitError::Unauthorized("list deployments"));
    }

    let mut deployments = Vec::new();
    if req.deployment_id.is_empty() {
        let listed = deploys::list(
            &state.pool,
            &req.name_search,
            &req.key_name_search,
            req.count,
        )
        .await?;
        for dep in listed {
            deployments.push(stats_entry(state, &dep, req.get_responses).await?);
        }
    } else {
        let dep = deploys::find(&state.pool, &req.deployment_id)
            .await?
            .ok_or_else(|| {
                ConduitError::not_found(format!("deployment '{}'", req.deployment_id))
            })?;
        deployments.push(stats_entry(state, &dep, true).await?);
    }

    let mut resp = DeploymentStatsResponse {
        deployments,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

async fn stats_entry(
    state: &BrokerState,
    dep: &deploys::Deployment,
    with_responses: bool,
) -> Result<DeploymentStats, ConduitError> {
    let stats = deploys::stats(&state.pool, &dep.id).await?;
    let responses = if with_responses {
        deploys::responses(&state.pool, &dep.id)
            .await?
            .into_iter()
            .map(|row| DeploymentResponse {
                mailbox: row.mailbox,
                response: row.response,
                responded_at: unix_to_rfc3339(row.responded_at),
                is_error: row.is_error,
            })
            .collect()
    } else {
        Vec::new()
    };
    Ok(DeploymentStats {
        id: dep.id.clone(),
        name: dep.name.clone(),
        deployed_by: dep.deployed_by.clone(),
        created_at: unix_to_rfc3339(dep.deployed_at),
        message_count: stats.message_count,
        pending_count: stats.pending_count,
        response_count: stats.response_count,
        responses,
    })
}

pub(super) async fn system_stats(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<SimpleRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_system_stats(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_system_stats(
    state: &BrokerState,
    req: SimpleRequest,
) -> Result<SystemStatsResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_admin() {
        return Err(ConduitError::Unauthorized("view statistics"));
    }
    let stats = mailboxes::stats(&state.pool).await?;
    let db_version = db::db_version(&state.pool).await?;
    let files = state.assets.stats().await;
    let mut resp = SystemStatsResponse {
        total_mailboxes: stats.mailbox_count,
        message_count: stats.message_count,
        pending_messages: stats.pending_messages,
        connected_clients: state.hub.connected() as i64,
        db_version,
        file_store_count: files.file_count,
        file_store_size: files.byte_size,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn client_stats(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<SimpleRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_client_stats(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_client_stats(
    state: &BrokerState,
    req: SimpleRequest,
) -> Result<ClientStatusResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_admin() {
        return Err(ConduitError::Unauthorized("view statistics"));
    }
    let clients = mailboxes::all(&state.pool)
        .await?
        .into_iter()
        .map(|mb| ClientStatus {
            online: state.hub.is_online(&mb.id),
            host: mb.last_seen_host,
            version: mb.last_seen_version,
            last_seen_at: mb.last_seen_at.map(unix_to_rfc3339).unwrap_or_default(),
            mailbox: mb.id,
        })
        .collect();
    let mut resp = ClientStatusResponse {
        clients,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}
