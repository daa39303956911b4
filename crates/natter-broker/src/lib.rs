//! natter-broker: rendezvous broker for natter.
//!
//! Listening Clients register a name on a long-lived control connection;
//! Forwarding Clients ask for a session to a named peer. The broker pairs the
//! two sides of each session and relays bytes between them.

pub mod broker;
pub mod config;
pub mod registry;
pub mod sessions;

pub use broker::{Broker, BrokerState};
pub use config::BrokerConfig;
pub use registry::{ConnectionRegistry, ControlHandle};
pub use sessions::SessionTable;

use natter_core::NatterResult;

/// Bind `bind_address` with default settings and serve until an error.
pub async fn broker_listen(bind_address: &str) -> NatterResult<()> {
    Broker::bind(BrokerConfig::with_bind(bind_address))
        .await?
        .run()
        .await
}
