//! The worker loop: poll the mailbox, execute what arrives, report back,
//! ack. Transport errors feed an exponential backoff; script failures and
//! timeouts become error responses and never stop the loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Context;
use conduit_client::Client;
use conduit_structs::GetMessageResponse;
use rand::Rng;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::engine::{HostContext, Responder, ScriptEngine};

/// Retries cap out here; the backoff is `count² + rand(0..=count)` seconds.
const MAX_ERROR_COUNT: u64 = 15;

pub async fn run(config: &Config, one_shot: bool) -> anyhow::Result<()> {
    let client = Arc::new(config.mailbox_client()?);
    if client.mailbox().is_empty() {
        anyhow::bail!("no mailbox configured; set mailbox.name and mailbox.key");
    }
    if config.master.enabled {
        tracing::info!(address = %config.master.address, host = %config.master.host,
            "master mode: broker traffic routed through the configured proxy");
    }
    let http = reqwest::Client::new();
    let asset_dir = tempfile::tempdir().context("create asset directory")?;
    let mut error_count: u64 = 0;
    let mut persistent: Vec<ScriptEngine> = Vec::new();

    tracing::info!(mailbox = %client.mailbox(), "waiting for messages");
    loop {
        let jitter = rand::rng().random_range(2000..=3000);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let resp = match client.get_message().await {
            Ok(resp) => {
                error_count = 0;
                resp
            }
            Err(err) => {
                tracing::error!(error = %err, "error getting messages");
                error_count = (error_count + 1).min(MAX_ERROR_COUNT);
                let backoff = error_count * error_count + rand::rng().random_range(0..=error_count);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                continue;
            }
        };

        if !resp.is_empty() {
            tracing::info!(message = %resp.message, "script received");
            if let Some(engine) =
                process_message(config, &client, &http, asset_dir.path(), &resp).await
            {
                persistent.push(engine);
                tracing::debug!(retained = persistent.len(), "script engine retained");
            }
        }
        if one_shot {
            break;
        }
    }
    Ok(())
}

/// Execute one delivered message end to end. Returns the engine when the
/// script asked to be kept alive.
async fn process_message(
    config: &Config,
    client: &Arc<Client>,
    http: &reqwest::Client,
    asset_dir: &std::path::Path,
    resp: &GetMessageResponse,
) -> Option<ScriptEngine> {
    let asset_path = if resp.asset.is_empty() {
        None
    } else {
        match client.download_asset(&resp.asset, asset_dir).await {
            Ok(path) => {
                tracing::info!(asset = %resp.asset, path = %path.display(), "asset downloaded");
                Some(path)
            }
            Err(err) => {
                tracing::error!(error = %err, asset = %resp.asset, "could not download asset");
                if let Err(err) = client.respond(&resp.message, "could not download asset", true).await
                {
                    tracing::error!(error = %err, "could not post response");
                }
                ack(client, &resp.message).await;
                return None;
            }
        }
    };

    let host = HostContext {
        deployment_id: resp.deployment.clone(),
        script_id: resp.message.clone(),
        asset_path,
        agents: config.agents.clone(),
        agent_access_key: config.access_key.clone(),
        responder: Responder::Broker {
            client: client.clone(),
            message: resp.message.clone(),
        },
        runtime: tokio::runtime::Handle::current(),
        http: http.clone(),
    };
    let mut engine = ScriptEngine::new(host);
    let kill = engine.kill_switch();

    let body = resp.body.clone();
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = engine.run(&body);
        let _ = tx.send((engine, result));
    });

    let started = Instant::now();
    let timeout = Duration::from_secs(config.script_timeout);
    let mut retained = None;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok((engine, Ok(())))) => {
            tracing::info!(elapsed = ?started.elapsed(), message = %resp.message, "script executed");
            if engine.wants_persistence() {
                retained = Some(engine);
            }
        }
        Ok(Ok((_, Err(err)))) => {
            tracing::error!(error = %err, message = %resp.message, "error executing script");
            if let Err(err) = client.respond(&resp.message, &err, true).await {
                tracing::error!(error = %err, "could not post response");
            }
        }
        Ok(Err(_)) => {
            tracing::error!(message = %resp.message, "script task dropped");
            if let Err(err) = client.respond(&resp.message, "script execution failed", true).await {
                tracing::error!(error = %err, "could not post response");
            }
        }
        Err(_) => {
            // the abandoned task terminates at its next operation; if the
            // script blocks inside a host call it leaks, which the trust
            // model accepts
            kill.store(true, Ordering::Relaxed);
            tracing::warn!(message = %resp.message, "timing out script");
            if let Err(err) = client.respond(&resp.message, "script timed out", true).await {
                tracing::error!(error = %err, "could not post response");
            }
        }
    }

    ack(client, &resp.message).await;
    retained
}

/// Delete the message; a failure means redelivery, which workers tolerate.
async fn ack(client: &Arc<Client>, message: &str) {
    match client.delete(message).await {
        Ok(_) => tracing::debug!(message = %message, "script confirmed"),
        Err(err) => tracing::error!(error = %err, message = %message, "could not confirm script"),
    }
}

#[cfg(test)]
mod tests {
    use super::MAX_ERROR_COUNT;

    #[test]
    fn backoff_caps_at_225_seconds() {
        let worst = MAX_ERROR_COUNT * MAX_ERROR_COUNT + MAX_ERROR_COUNT;
        assert_eq!(MAX_ERROR_COUNT * MAX_ERROR_COUNT, 225);
        assert!(worst <= 240);
    }
}
