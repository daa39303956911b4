//! Broker configuration: TOML file + CLI overrides.

use natter_core::{NatterError, NatterResult, DEFAULT_MAX_FRAME_LEN};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
}

/// `[broker]` section of the config TOML. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    /// Listen address, `host:port`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Cap on live sessions across the broker.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// How long a new connection has to send its first frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Silence on a control connection longer than this drops it.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// How long a forward waits for the listener's Join.
    #[serde(default = "default_session_setup_timeout")]
    pub session_setup_timeout: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_sessions: default_max_sessions(),
            max_frame_len: default_max_frame_len(),
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: default_idle_timeout(),
            session_setup_timeout: default_session_setup_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:7000".to_string()
}
fn default_max_sessions() -> usize {
    1024
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    45
}
fn default_session_setup_timeout() -> u64 {
    15
}

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: String,
    /// Concurrent pending + active sessions.
    pub max_sessions: usize,
    pub max_frame_len: usize,
    /// How long a new connection may stay silent before its first frame.
    pub handshake_timeout: Duration,
    /// Silence allowed on a control connection or one direction of a relay.
    pub idle_timeout: Duration,
    /// How long a requester waits for the listener to join.
    pub session_setup_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerSection::default().into()
    }
}

impl From<BrokerSection> for BrokerConfig {
    fn from(s: BrokerSection) -> Self {
        Self {
            bind_addr: s.bind,
            max_sessions: s.max_sessions,
            max_frame_len: s.max_frame_len,
            handshake_timeout: Duration::from_secs(s.handshake_timeout),
            idle_timeout: Duration::from_secs(s.idle_timeout),
            session_setup_timeout: Duration::from_secs(s.session_setup_timeout),
        }
    }
}

impl BrokerConfig {
    /// Default broker config for the given bind address.
    pub fn with_bind(bind_addr: &str) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            ..Self::default()
        }
    }

    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_max_sessions: Option<usize>,
        cli_idle_timeout: Option<u64>,
    ) -> NatterResult<Self> {
        let mut section = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| NatterError::Config(format!("config parse error: {e}")))?
                        .broker
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    BrokerSection::default()
                }
            }
            None => BrokerSection::default(),
        };

        // Merge CLI overrides
        if let Some(bind) = cli_bind {
            section.bind = bind.to_string();
        }
        if let Some(max) = cli_max_sessions {
            section.max_sessions = max;
        }
        if let Some(idle) = cli_idle_timeout {
            section.idle_timeout = idle;
        }

        if section.max_frame_len < 64 {
            return Err(NatterError::Config(format!(
                "max_frame_len too small: {}",
                section.max_frame_len
            )));
        }
        Ok(section.into())
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
