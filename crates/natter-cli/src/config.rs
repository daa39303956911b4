//! Client configuration at `~/.natter/client.toml`.
//!
//! Provides the default name, broker and timings. The `[listen]` table holds
//! the target policy used by `natter listen`. CLI flags always override
//! config file values.

use anyhow::{Context, Result};
use natter_client::TargetPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub listen: ListenSection,
}

/// Settings shared by `listen` and `forward`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    /// Name to register or to send as a forward source (empty = none).
    #[serde(default)]
    pub name: String,

    /// Broker address (empty = none).
    #[serde(default)]
    pub broker: String,

    /// Seconds to wait for the broker to accept and answer.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            broker: String::new(),
            connect_timeout: default_connect_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Target policy for a Listening Client.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    /// Target patterns, e.g. `"*"`, `"localhost:22"`, `"*:8080"`.
    #[serde(default = "default_allowed_targets")]
    pub allowed_targets: Vec<String>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Let forwarders run commands on this host.
    #[serde(default)]
    pub allow_commands: bool,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            allowed_targets: default_allowed_targets(),
            max_sessions: default_max_sessions(),
            allow_commands: false,
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    45
}

fn default_allowed_targets() -> Vec<String> {
    vec!["*".into()]
}

fn default_max_sessions() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        if config.client.heartbeat_interval == 0 {
            anyhow::bail!("heartbeat_interval must be at least 1 second");
        }
        if config.client.idle_timeout <= config.client.heartbeat_interval {
            anyhow::bail!("idle_timeout must be longer than heartbeat_interval");
        }

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.client.connect_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client.heartbeat_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client.idle_timeout)
    }

    pub fn policy(&self) -> TargetPolicy {
        TargetPolicy {
            allowed_targets: self.listen.allowed_targets.clone(),
            max_sessions: self.listen.max_sessions,
            allow_commands: self.listen.allow_commands,
        }
    }
}

/// Default config location, `~/.natter/client.toml`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".natter")
        .join("client.toml")
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
