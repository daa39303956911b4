//! natter: reach TCP services behind NAT through a rendezvous broker.
//!
//! `natter listen` registers this host under a name and serves forwarded
//! sessions. `natter forward` accepts local connections and relays each one
//! to a target on a named peer.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use natter_client::{
    ConnectHook, ForwardConfig, Forwarder, ListenConfig, ListeningClient, RateLimitHook,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// natter: NAT traversal by rendezvous and relay
#[derive(Parser)]
#[command(name = "natter", version, about = "Forward TCP ports between peers through a natter broker")]
struct Cli {
    /// Broker address, e.g. broker.example.com:7000
    #[arg(short, long, global = true)]
    broker: Option<String>,

    /// Name of this client
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register with the broker and serve forwarded sessions
    Listen {
        /// Allowed target pattern (repeatable); replaces the configured list
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Allow forwarders to run commands on this host
        #[arg(long)]
        allow_commands: bool,

        /// Maximum concurrent sessions
        #[arg(long)]
        max_sessions: Option<usize>,
    },

    /// Forward a local address to a target on a named peer
    Forward {
        /// Local address to listen on, e.g. 127.0.0.1:9000 or :9000; `-` relays stdin/stdout
        local: String,

        /// Name of the peer to forward to
        peer: String,

        /// Target address on the peer; `:22` means the peer's localhost
        target: String,

        /// Serve a single connection, then exit with its outcome
        #[arg(long)]
        once: bool,

        /// Limit accepted connections per source IP per minute
        #[arg(long)]
        max_conn_per_minute: Option<u32>,

        /// Command to run on the peer instead of dialing TARGET
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing. Logs go to stderr so `forward -` keeps stdout clean.
    use tracing_subscriber::EnvFilter;
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("natter: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;

    let broker = cli
        .broker
        .clone()
        .or_else(|| non_empty(&cfg.client.broker))
        .context("no broker address; pass --broker or set client.broker in the config file")?;
    let name = cli.name.clone().or_else(|| non_empty(&cfg.client.name));

    match cli.command {
        Command::Listen {
            allow,
            allow_commands,
            max_sessions,
        } => {
            let name = name.context("no name to register; pass --name or set client.name")?;
            let mut config = ListenConfig::new(&name, &broker);
            config.connect_timeout = cfg.connect_timeout();
            config.heartbeat_interval = cfg.heartbeat_interval();
            config.idle_timeout = cfg.idle_timeout();
            config.policy = cfg.policy();
            if !allow.is_empty() {
                config.policy.allowed_targets = allow;
            }
            if allow_commands {
                config.policy.allow_commands = true;
            }
            if let Some(max) = max_sessions {
                config.policy.max_sessions = max;
            }

            let client = ListeningClient::new(config);
            tokio::select! {
                result = client.run() => result.context("listening client stopped")?,
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
            Ok(())
        }
        Command::Forward {
            local,
            peer,
            target,
            once,
            max_conn_per_minute,
            command,
        } => {
            let name = name.unwrap_or_default();
            let mut config = ForwardConfig::new(&name, &broker, &local, &peer, &target);
            config.target_command = command;
            config.listen_once = once;
            config.connect_timeout = cfg.connect_timeout();
            config.heartbeat_interval = cfg.heartbeat_interval();
            config.idle_timeout = cfg.idle_timeout();

            if local == "-" {
                return natter_client::forward_stdio(&config)
                    .await
                    .context("stdio session failed");
            }

            let hook = max_conn_per_minute.map(|max| {
                Arc::new(RateLimitHook::new(max, Duration::from_secs(60))) as Arc<dyn ConnectHook>
            });
            let forwarder = Forwarder::bind(config, hook)
                .await
                .with_context(|| format!("cannot forward {local}"))?;
            tokio::select! {
                result = forwarder.run() => result.context("forwarding stopped")?,
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
            Ok(())
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
