use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use conduit_client::{Client, ClientConfig};
use serde::Deserialize;

/// The operator config file, shared by every subcommand. All keys are
/// optional; missing ones fall back to the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker address: the listen address in server mode, the target
    /// everywhere else.
    pub host: String,
    /// Worker identity: the mailbox polled by `run` and its bound key.
    pub mailbox: Identity,
    /// Admin identity used by deploy/register/info commands.
    pub admin: Identity,
    pub enable_long_polling: bool,
    pub throttle_delay_ms: u64,
    /// Hard wall-clock limit for one script execution, in seconds.
    pub script_timeout: u64,
    /// Named peer workers reachable from scripts via the agent host call.
    pub agents: BTreeMap<String, String>,
    /// Shared secret for agent-to-agent requests.
    pub access_key: String,
    pub agent_listen: String,
    pub master: Master,
    pub show_requests: bool,
    pub db_path: Option<PathBuf>,
    pub files_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub name: String,
    pub key: String,
}

/// Optional outbound proxy for all broker traffic.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Master {
    pub enabled: bool,
    pub host: String,
    pub address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:4111".to_string(),
            mailbox: Identity::default(),
            admin: Identity::default(),
            enable_long_polling: true,
            throttle_delay_ms: 500,
            script_timeout: 300,
            agents: BTreeMap::new(),
            access_key: String::new(),
            agent_listen: "127.0.0.1:4112".to_string(),
            master: Master::default(),
            show_requests: false,
            db_path: None,
            files_path: None,
        }
    }
}

impl Config {
    /// Load the config file: an explicit `--config` path must exist, while
    /// the default locations (working directory, then the executable's
    /// directory) are optional.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            let config = toml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?;
            tracing::debug!(path = %path.display(), "using config file");
            return Ok(config);
        }
        for candidate in Self::default_locations() {
            let Ok(raw) = std::fs::read_to_string(&candidate) else {
                continue;
            };
            let config = toml::from_str(&raw)
                .with_context(|| format!("parse config {}", candidate.display()))?;
            tracing::debug!(path = %candidate.display(), "using config file");
            return Ok(config);
        }
        Ok(Self::default())
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("conduit.toml")];
        if let Some(dir) = exe_dir() {
            paths.push(dir.join("conduit.toml"));
        }
        paths
    }

    /// Broker database file, beside the executable unless configured.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| exe_dir().unwrap_or_default().join("mailboxes.db"))
    }

    /// Asset store directory, beside the executable unless configured.
    pub fn files_path(&self) -> PathBuf {
        self.files_path
            .clone()
            .unwrap_or_else(|| exe_dir().unwrap_or_default().join("files"))
    }

    pub fn mailbox_client(&self) -> anyhow::Result<Client> {
        self.client(&self.mailbox)
    }

    pub fn admin_client(&self) -> anyhow::Result<Client> {
        self.client(&self.admin)
    }

    fn client(&self, identity: &Identity) -> anyhow::Result<Client> {
        Client::new(ClientConfig {
            host: self.host.clone(),
            key_name: identity.name.clone(),
            secret: identity.key.clone(),
            mailbox: self.mailbox.name.clone(),
            proxy: self.proxy_url(),
            show_requests: self.show_requests,
        })
    }

    fn proxy_url(&self) -> Option<String> {
        if self.master.host.is_empty() {
            None
        } else {
            Some(format!("http://{}", self.master.host))
        }
    }
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config: Config = toml::from_str(
            r#"
            host = "broker.example:4111"

            [mailbox]
            name = "newton.web"
            key = "sekrit"
            "#,
        )
        .expect("parse");
        assert_eq!(config.host, "broker.example:4111");
        assert_eq!(config.mailbox.name, "newton.web");
        assert_eq!(config.script_timeout, 300);
        assert!(config.enable_long_polling);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn agents_map_parses() {
        let config: Config = toml::from_str(
            r#"
            access_key = "shared"

            [agents]
            db = "10.0.0.8:4112"
            web = "10.0.0.9:4112"
            "#,
        )
        .expect("parse");
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents["db"], "10.0.0.8:4112");
    }
}
