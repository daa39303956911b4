//! natter-client: the two natter client roles.
//!
//! - [`ListeningClient`] registers a name with the broker and opens the
//!   requested target for every forwarded session.
//! - [`Forwarder`] accepts local TCP connections and forwards each one to a
//!   target on a named peer.
//!
//! # Quick Start
//!
//! ```no_run
//! use natter_client::{client_forward, client_listen};
//!
//! # async fn example() -> natter_core::NatterResult<()> {
//! // On the machine that should be reachable:
//! tokio::spawn(async { client_listen("bob", "broker.example.com:7000").await });
//!
//! // On the machine that wants to reach bob's SSH server:
//! client_forward("alice", "broker.example.com:7000", "127.0.0.1:2222", "bob", ":22", false, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod forward;
pub mod hook;
pub mod listen;
pub mod net;
pub mod policy;

// Re-export primary public types.
pub use config::{ForwardConfig, ListenConfig};
pub use forward::{client_forward, forward_stdio, forward_stream, Forwarder};
pub use hook::{ConnectHook, RateLimitHook};
pub use listen::{client_listen, ListeningClient, Registration};
pub use policy::{TargetPolicy, TargetPolicyEnforcer};

// Re-export natter-core error types for convenience.
pub use natter_core::{NatterError, NatterResult};
