pub mod admin;
pub mod deploy;
pub mod info;
pub mod server;

use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::engine::{HostContext, ScriptEngine};

/// Run a local script file through the engine, host calls included but no
/// broker attached.
pub async fn execute(config: &Config, script: &Path) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(script)
        .with_context(|| format!("read {}", script.display()))?;
    let mut host = HostContext::local(tokio::runtime::Handle::current());
    host.agents = config.agents.clone();
    host.agent_access_key = config.access_key.clone();

    let started = Instant::now();
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let mut engine = ScriptEngine::new(host);
        let _ = tx.send(engine.run(&body));
    });
    match rx.await {
        Ok(Ok(())) => {
            println!("Script executed in {:?}.", started.elapsed());
            Ok(())
        }
        Ok(Err(err)) => anyhow::bail!("script error: {err}"),
        Err(_) => anyhow::bail!("script execution failed"),
    }
}
