//! The broker's HTTP surface. Every endpoint is a POST taking a flat JSON
//! body; responses are signed with the requester's own key secret, and every
//! handled failure collapses to a 400 with an `{error}` body.

mod admin;
mod files;
mod messages;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use conduit_structs::{ApiError, ConduitError, Signed, WIRE_VERSION};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::access::{self, AccessKey};
use crate::assets::AssetStore;
use crate::longpoll::PollHub;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub enable_long_polling: bool,
    /// Applied before returning an empty get when long-polling is off, so
    /// workers cannot spin on the broker.
    pub throttle_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enable_long_polling: true,
            throttle_delay: Duration::from_millis(500),
        }
    }
}

pub struct BrokerState {
    pub pool: SqlitePool,
    pub hub: PollHub,
    pub assets: AssetStore,
    pub config: BrokerConfig,
}

impl BrokerState {
    pub fn new(pool: SqlitePool, assets: AssetStore, config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            hub: PollHub::new(),
            assets,
            config,
        })
    }
}

pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/put", post(messages::put_message))
        .route("/get", post(messages::get_message))
        .route("/delete", post(messages::delete_message))
        .route("/deploy/respond", post(messages::deploy_respond))
        .route("/deploy/list", post(admin::deploy_info))
        .route("/stats", post(admin::system_stats))
        .route("/stats/clients", post(admin::client_stats))
        .route("/register", post(admin::register))
        .route("/deregister", post(admin::deregister))
        .route("/upload", post(files::accept_file))
        .route("/checkfile", post(files::check_file))
        .route("/asset", post(files::get_asset))
        .route("/upgrade", post(files::upgrade))
        // asset uploads are far larger than the default body cap
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .with_state(state)
}

/// Serve forever on an already-bound listener. The janitor for the asset
/// store is the caller's business; this only runs the HTTP loop.
pub async fn serve(
    state: Arc<BrokerState>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await
}

pub(crate) fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ConduitError> {
    serde_json::from_slice(body).map_err(|_| ConduitError::Parse)
}

pub(crate) fn json_response<T: Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub(crate) fn error_response(err: &ConduitError) -> Response {
    tracing::debug!(error = %err, "request rejected");
    (StatusCode::BAD_REQUEST, Json(ApiError::from(err))).into_response()
}

/// The shared front half of every handler: resolve the key named in the
/// envelope and check the signature. Version skew is advisory only.
pub(crate) async fn authenticate<T: Signed>(
    pool: &SqlitePool,
    req: &T,
) -> Result<AccessKey, ConduitError> {
    let name = req.key_name();
    let key = access::find_by_name(pool, name)
        .await?
        .ok_or_else(|| ConduitError::not_found(format!("access key '{name}'")))?;
    req.validate(&key.secret)?;
    let client_version = &req.envelope().version;
    if client_version != WIRE_VERSION {
        tracing::warn!(client = %client_version, broker = WIRE_VERSION, key = %key.name,
            "client version differs from broker");
    }
    Ok(key)
}
