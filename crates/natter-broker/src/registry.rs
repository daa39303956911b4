//! Registry of named Listening Clients.
//!
//! Maps each registered name to a [`ControlHandle`], the only way other
//! tasks can write to that client's control connection. Duplicate names are
//! rejected rather than overwritten.

use natter_core::messages::Message;
use natter_core::{NatterError, NatterResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

/// One frame queued for a control connection's writer task.
#[derive(Debug)]
pub struct Outbound {
    pub msg: Message,
    /// Resolved with the write outcome once the frame hit the socket.
    pub ack: Option<oneshot::Sender<bool>>,
}

/// Write access to a registered control connection.
///
/// Cloning is cheap; every clone feeds the same writer task, which writes
/// frames in the order they were queued. Once the writer task is gone every
/// send fails with `PeerUnreachable`.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    /// Broker-local id of the control connection; distinguishes a name's
    /// current owner from an earlier one.
    pub connection_id: u64,
    /// Address the listener connected from.
    pub remote_addr: SocketAddr,
    pub registered_at: Instant,
    tx: mpsc::Sender<Outbound>,
}

impl ControlHandle {
    pub fn new(connection_id: u64, remote_addr: SocketAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection_id,
            remote_addr,
            registered_at: Instant::now(),
            tx,
        }
    }

    /// Queue a frame and wait until the writer task reports it written.
    ///
    /// # Errors
    ///
    /// `PeerUnreachable` if the writer task is gone, or if it dropped the
    /// frame or failed to write it.
    pub async fn send(&self, msg: Message) -> NatterResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let name = msg.name();
        self.tx
            .send(Outbound {
                msg,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| NatterError::PeerUnreachable("control connection closed".into()))?;
        match ack_rx.await {
            Ok(true) => Ok(()),
            _ => Err(NatterError::PeerUnreachable(format!("failed to deliver {name}"))),
        }
    }

    /// Queue a frame without waiting for it to be written.
    pub async fn post(&self, msg: Message) -> NatterResult<()> {
        self.tx
            .send(Outbound { msg, ack: None })
            .await
            .map_err(|_| NatterError::PeerUnreachable("control connection closed".into()))
    }
}

/// Concurrent map of peer name to control handle.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, ControlHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Fails with `NameInUse` if it is already taken.
    pub async fn register(&self, name: &str, handle: ControlHandle) -> NatterResult<()> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(name) {
            return Err(NatterError::NameInUse(name.to_string()));
        }
        info!(peer = %name, remote = %handle.remote_addr, conn = handle.connection_id, "peer registered");
        peers.insert(name.to_string(), handle);
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> NatterResult<ControlHandle> {
        self.peers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NatterError::PeerNotFound(name.to_string()))
    }

    /// Remove `name` if it is still owned by `connection_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub async fn remove(&self, name: &str, connection_id: u64) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(name) {
            Some(h) if h.connection_id == connection_id => {
                peers.remove(name);
                debug!(peer = %name, conn = connection_id, "peer unregistered");
                true
            }
            _ => false,
        }
    }

    /// Whether `name` is still registered by `connection_id`.
    pub async fn is_current(&self, name: &str, connection_id: u64) -> bool {
        self.peers
            .read()
            .await
            .get(name)
            .is_some_and(|h| h.connection_id == connection_id)
    }

    /// Registered names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}
