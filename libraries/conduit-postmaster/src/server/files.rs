//! Asset lifecycle endpoints and the self-upgrade stream. `/upload` is the
//! one multipart route: JSON metadata in the `data` field, blob bytes in
//! `file`. `/asset` and `/upgrade` answer with raw byte streams.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use conduit_structs::{
    CheckFileRequest, ConduitError, GetAssetRequest, Signed, SimpleResponse, UploadFileRequest,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{BrokerState, authenticate, decode, error_response, json_response};
use crate::access::AccessKey;
use crate::assets::is_valid_md5;
use crate::storage_err;

pub(super) async fn accept_file(
    State(state): State<Arc<BrokerState>>,
    multipart: Multipart,
) -> Response {
    match handle_upload(&state, multipart).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_upload(
    state: &BrokerState,
    mut multipart: Multipart,
) -> Result<SimpleResponse, ConduitError> {
    let mut key: Option<AccessKey> = None;
    let mut request: Option<UploadFileRequest> = None;
    let mut stored = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ConduitError::Parse)?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("data") => {
                let text = field.text().await.map_err(|_| ConduitError::Parse)?;
                let req: UploadFileRequest =
                    serde_json::from_str(&text).map_err(|_| ConduitError::Parse)?;
                let upload_key = authenticate(&state.pool, &req).await?;
                if !upload_key.can_admin() {
                    return Err(ConduitError::Unauthorized("upload files"));
                }
                if !is_valid_md5(&req.md5) {
                    return Err(ConduitError::Parse);
                }
                key = Some(upload_key);
                request = Some(req);
            }
            Some("file") => {
                // metadata must precede the blob so the write is authorized
                let req = request.as_ref().ok_or(ConduitError::Parse)?;
                state.assets.ensure_root().await?;
                let path = state.assets.path_for(&req.md5);
                let mut file = tokio::fs::File::create(&path).await.map_err(storage_err)?;
                while let Some(chunk) = field.chunk().await.map_err(|_| ConduitError::Parse)? {
                    file.write_all(&chunk).await.map_err(storage_err)?;
                }
                file.flush().await.map_err(storage_err)?;
                drop(file);
                state.assets.verify(&req.md5).await?;
                stored = true;
            }
            _ => {}
        }
    }

    let (key, request) = match (key, request) {
        (Some(key), Some(request)) if stored => (key, request),
        _ => return Err(ConduitError::Parse),
    };
    tracing::info!(md5 = %request.md5, filename = %request.filename, by = %key.name,
        "asset uploaded");
    let mut resp = SimpleResponse {
        success: true,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn check_file(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<CheckFileRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_check_file(&state, req).await {
        Ok(resp) => json_response(resp),
        Err(err) => error_response(&err),
    }
}

async fn handle_check_file(
    state: &BrokerState,
    req: CheckFileRequest,
) -> Result<SimpleResponse, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    let mut resp = SimpleResponse {
        success: state.assets.exists(&req.md5).await,
        ..Default::default()
    };
    resp.sign(&key.name, &key.secret);
    Ok(resp)
}

pub(super) async fn get_asset(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<GetAssetRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_get_asset(&state, req).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err),
    }
}

async fn handle_get_asset(
    state: &BrokerState,
    req: GetAssetRequest,
) -> Result<Response, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    let file = state.assets.open(&req.md5).await?;
    tracing::info!(md5 = %req.md5, to = %key.name, "serving asset");
    Ok(stream_response(file))
}

pub(super) async fn upgrade(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let req = match decode::<conduit_structs::SimpleRequest>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&err),
    };
    match handle_upgrade(&state, req).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err),
    }
}

async fn handle_upgrade(
    state: &BrokerState,
    req: conduit_structs::SimpleRequest,
) -> Result<Response, ConduitError> {
    let key = authenticate(&state.pool, &req).await?;
    let exe = std::env::current_exe().map_err(storage_err)?;
    let file = tokio::fs::File::open(&exe).await.map_err(storage_err)?;
    tracing::info!(to = %key.name, "serving broker executable");
    Ok(stream_response(file))
}

fn stream_response(file: tokio::fs::File) -> Response {
    let stream = ReaderStream::new(file);
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}
