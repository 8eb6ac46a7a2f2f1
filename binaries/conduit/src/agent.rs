//! The agent listener: a one-endpoint signed RPC surface that executes
//! script fragments pushed from a peer worker's running script.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use conduit_structs::{AgentRequest, AgentResponse, Signed};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::engine::{HostContext, ScriptEngine};

struct AgentState {
    access_key: String,
    script_timeout: Duration,
}

pub async fn run(config: &Config) -> anyhow::Result<()> {
    if config.access_key.is_empty() {
        anyhow::bail!("no agent access_key configured");
    }
    let state = Arc::new(AgentState {
        access_key: config.access_key.clone(),
        script_timeout: Duration::from_secs(config.script_timeout),
    });
    let app = Router::new().route("/", post(command)).with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.agent_listen).await?;
    tracing::info!(listen = %config.agent_listen, "agent listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn command(State(state): State<Arc<AgentState>>, body: Bytes) -> Response {
    let Ok(req) = serde_json::from_slice::<AgentRequest>(&body) else {
        return failure(&state, "could not parse request");
    };
    if req.validate(&state.access_key).is_err() {
        return failure(&state, "could not validate signature");
    }

    let (tx, rx) = oneshot::channel();
    let function = req.function.clone();
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut engine = ScriptEngine::new(HostContext::local(runtime));
        let _ = tx.send(engine.run(&function));
    });

    match tokio::time::timeout(state.script_timeout, rx).await {
        Ok(Ok(Ok(()))) => success(&state),
        Ok(Ok(Err(err))) => {
            tracing::error!(error = %err, "agent script error");
            failure(&state, &err)
        }
        Ok(Err(_)) => failure(&state, "script execution failed"),
        Err(_) => failure(&state, "script timed out"),
    }
}

fn success(state: &AgentState) -> Response {
    let mut resp = AgentResponse {
        success: true,
        ..Default::default()
    };
    resp.sign("", &state.access_key);
    (StatusCode::OK, Json(resp)).into_response()
}

fn failure(state: &AgentState, error: &str) -> Response {
    let mut resp = AgentResponse {
        success: false,
        error: error.to_string(),
        ..Default::default()
    };
    resp.sign("", &state.access_key);
    (StatusCode::BAD_REQUEST, Json(resp)).into_response()
}

#[cfg(test)]
mod tests {
    use conduit_structs::{AgentRequest, Signed};

    #[test]
    fn agent_requests_verify_against_the_shared_key() {
        let mut req = AgentRequest {
            function: "log(\"hi\")".to_string(),
            ..Default::default()
        };
        req.sign("", "shared-secret");
        assert!(req.validate("shared-secret").is_ok());
        assert!(req.validate("other-secret").is_err());
    }
}
