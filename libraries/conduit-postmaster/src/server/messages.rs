//! Message-path endpoints: workers polling, acking, and responding, and
//! admins publishing deployments.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use bytes::Bytes;
use conduit_structs::{
    ConduitError, DeleteMessageRequest, DeleteMessageResponse, GetMessageRequest,
    GetMessageResponse, PutMessageRequest, PutMessageResponse, ResponseRequest, Signed,
    SimpleResponse,
};

use super::{BrokerState, authenticate, decode, error_response, json_response};
use crate::longpoll::PollHub;
use crate::{deploys, mailboxes, unix_to_rfc3339};

pub(super) async fn get_message(
    State(state): State<Arc<BrokerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let req = match decode::<GetMessageRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_get(&state, addr, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_get(
    state: &BrokerState,
    addr: SocketAddr,
    req: GetMessageRequest,
) -> Result<GetMessageResponse, ConduitError> {
    let mailbox = mailboxes::find(&state.pool, &req.mailbox)
        .await?
        .ok_or_else(|| ConduitError::not_found(format!("mailbox '{}'", req.mailbox)))?;
    let key = authenticate(&state.pool, &req).await?;
    if !key.can_get(&mailbox.id) {
        return Err(ConduitError::Unauthorized("get messages from this mailbox"));
    }
    mailboxes::checkin(
        &state.pool,
        &mailbox.id,
        &addr.ip().to_string(),
        &req.envelope.version,
    )
    .await?;

    let mut msg = mailboxes::dequeue(&state.pool, &mailbox.id).await?;
    if msg.is_none() {
        if state.config.enable_long_polling {
            msg = state.hub.park(&mailbox.id, PollHub::park_timeout()).await;
        } else {
            tokio::time::sleep(state.config.throttle_delay).await;
        }
    }

    let Some(msg) = msg else {
        let mut resp = GetMessageResponse::default();
        resp.sign(&key.name, &key.secret);
        return Ok(resp);
    };
    let asset = deploys::find(&state.pool, &msg.deployment)
        .await?
        .map(|dep| dep.asset)
        .unwrap_or_default();
    tracing::info!(message = %msg.id, mailbox = %mailbox.id, "delivering message");
    let mut resp = GetMessageResponse {
        message: msg.id,
        body: msg.body,
        created_at: unix_to_rfc3339(msg.created_at),
        receive_count: msg.receive_count,
        deployment: msg.deployment,
        asset,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn put_message(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<PutMessageRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_put(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_put(
    state: &BrokerState,
    req: PutMessageRequest,
) -> Result<PutMessageResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;

    // target set = pattern matches ∪ explicit list, deduplicated
    let mut targets = Vec::new();
    let mut seen = HashSet::new();
    if !req.pattern.is_empty() {
        for mb in mailboxes::search(&state.pool, &req.pattern).await? {
            if seen.insert(mb.id.clone()) {
                targets.push(mb.id);
            }
        }
    }
    for id in &req.mailboxes {
        let mb = mailboxes::find(&state.pool, id)
            .await?
            .ok_or_else(|| ConduitError::not_found(format!("mailbox '{id}'")))?;
        if seen.insert(mb.id.clone()) {
            targets.push(mb.id);
        }
    }
    if targets.is_empty() {
        return Err(ConduitError::not_found("a target mailbox"));
    }
    for target in &targets {
        if !key.can_put(target) {
            return Err(ConduitError::Unauthorized("send messages to this mailbox"));
        }
    }
    if !req.asset.is_empty() && !state.assets.exists(&req.asset).await {
        return Err(ConduitError::not_found(format!(
            "asset '{}' on server",
            req.asset
        )));
    }

    let dep = deploys::create(
        &state.pool,
        &req.body,
        &req.asset,
        &req.deployment_name,
        &key.name,
    )
    .await?;
    let delivered = deploys::deploy_to(&state.pool, &state.hub, &dep, &targets).await?;

    let mut resp = PutMessageResponse {
        message_size: req.body.len() as i64,
        mailboxes: delivered,
        deployment_id: dep.id,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn delete_message(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<DeleteMessageRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_delete(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_delete(
    state: &BrokerState,
    req: DeleteMessageRequest,
) -> Result<DeleteMessageResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    // the message may already be gone; delete stays an idempotent success,
    // but a live message still gets its capability check
    if let Some(msg) = mailboxes::find_message(&state.pool, &req.message).await? {
        if !key.can_delete(&msg.mailbox) {
            return Err(ConduitError::Unauthorized("delete messages in this mailbox"));
        }
    }
    mailboxes::delete_message(&state.pool, &req.message).await?;
    tracing::info!(message = %req.message, "message deleted");
    let mut resp = DeleteMessageResponse {
        message: req.message,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn deploy_respond(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<ResponseRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_respond(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_respond(
    state: &BrokerState,
    req: ResponseRequest,
) -> Result<SimpleResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    let msg = mailboxes::find_message(&state.pool, &req.message)
        .await?
        .ok_or_else(|| ConduitError::not_found(format!("message '{}'", req.message)))?;
    let dep = deploys::find(&state.pool, &msg.deployment)
        .await?
        .ok_or_else(|| ConduitError::not_found(format!("deployment '{}'", msg.deployment)))?;
    if !key.can_get(&msg.mailbox) {
        return Err(ConduitError::Unauthorized("respond for this mailbox"));
    }
    deploys::add_response(&state.pool, &dep.id, &msg.mailbox, &req.response, req.error).await?;
    tracing::info!(deployment = %dep.id, mailbox = %msg.mailbox, is_error = req.error,
        "response recorded");
    let mut resp = SimpleResponse {
        success: true,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}
