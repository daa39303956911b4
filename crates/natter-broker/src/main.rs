//! natter-broker: rendezvous and relay broker binary.

use clap::Parser;
use natter_broker::{Broker, BrokerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// natter-broker: rendezvous and relay broker
#[derive(Parser, Debug)]
#[command(name = "natter-broker", version, about = "natter rendezvous and relay broker")]
struct Cli {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.natter/broker.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Idle timeout in seconds for control and data connections
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting natter-broker");

    let config_path = PathBuf::from(&cli.config);
    let config = match BrokerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.max_sessions,
        cli.idle_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let broker = match Broker::bind(config).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!(error = %e, "broker error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("natter-broker stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
