//! Forwarding Client: accepts local connections and relays each one to a
//! target on a named peer through the broker.

use crate::config::ForwardConfig;
use crate::hook::ConnectHook;
use crate::net::connect_broker;
use natter_core::messages::*;
use natter_core::{relay_session, write_frame, FrameReader, NatterError, NatterResult, RelayOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A bound Forwarding Client.
pub struct Forwarder {
    config: Arc<ForwardConfig>,
    listener: TcpListener,
    hook: Option<Arc<dyn ConnectHook>>,
}

impl Forwarder {
    /// Bind the local listening socket.
    ///
    /// # Arguments
    ///
    /// * `config` - Where to listen and which peer and target to reach.
    /// * `hook` - Optional admission check run for every accepted
    ///   connection before the broker is contacted.
    ///
    /// # Errors
    ///
    /// `ForwardRejected` with `SelfForward` when `peer_name` equals
    /// `self_name` (checked before binding), `Transport` when the local
    /// address cannot be bound.
    pub async fn bind(
        config: ForwardConfig,
        hook: Option<Arc<dyn ConnectHook>>,
    ) -> NatterResult<Self> {
        reject_self_forward(&config)?;
        let bind = config.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| NatterError::Transport(format!("bind {bind}: {e}")))?;
        info!(
            local = %listener.local_addr()?,
            peer = %config.peer_name,
            target = %config.peer_target_addr,
            "forwarding"
        );
        Ok(Self {
            config: Arc::new(config),
            listener,
            hook,
        })
    }

    pub fn local_addr(&self) -> NatterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept local connections, one session task each.
    ///
    /// A failed session closes only its own local connection; the loop keeps
    /// accepting. With `listen_once` set, serves exactly one connection to
    /// completion and returns its outcome.
    ///
    /// # Errors
    ///
    /// Only in `listen_once` mode: the accept error, the broker's refusal
    /// (`ForwardRejected`), a hook rejection, or the session's close
    /// reason as `SessionClosed`. Otherwise runs until cancelled.
    pub async fn run(self) -> NatterResult<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(v) => v,
                Err(e) if self.config.listen_once => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            if self.config.listen_once {
                let outcome = serve_connection(&self.config, self.hook.as_deref(), stream, peer).await?;
                return outcome.into_result();
            }

            let config = self.config.clone();
            let hook = self.hook.clone();
            tokio::spawn(async move {
                match serve_connection(&config, hook.as_deref(), stream, peer).await {
                    Ok(outcome) => debug!(local_peer = %peer, outcome = ?outcome, "connection finished"),
                    Err(e) => warn!(local_peer = %peer, error = %e, "connection failed"),
                }
            });
        }
    }
}

/// Forward `local_bind_address` on this host to `peer_target_addr` on
/// `peer_name` with default settings.
pub async fn client_forward(
    self_name: &str,
    broker_address: &str,
    local_bind_address: &str,
    peer_name: &str,
    peer_target_addr: &str,
    listen_once: bool,
    connect_hook: Option<Arc<dyn ConnectHook>>,
) -> NatterResult<()> {
    let mut config = ForwardConfig::new(
        self_name,
        broker_address,
        local_bind_address,
        peer_name,
        peer_target_addr,
    );
    config.listen_once = listen_once;
    Forwarder::bind(config, connect_hook).await?.run().await
}

/// Run one session over an arbitrary local stream pair, such as
/// stdin/stdout.
pub async fn forward_stream<LR, LW>(config: &ForwardConfig, local_r: LR, local_w: LW) -> NatterResult<RelayOutcome>
where
    LR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
{
    reject_self_forward(config)?;
    let (sid, reader, writer) = open_session(config).await?;
    info!(session = %sid.short(), peer = %config.peer_name, "session established");
    relay_session(sid, local_r, local_w, reader, writer, config.timings()).await
}

/// Forward this process's stdin/stdout as a single session.
pub async fn forward_stdio(config: &ForwardConfig) -> NatterResult<()> {
    forward_stream(config, tokio::io::stdin(), tokio::io::stdout())
        .await?
        .into_result()
}

fn reject_self_forward(config: &ForwardConfig) -> NatterResult<()> {
    if config.self_name == config.peer_name {
        return Err(NatterError::ForwardRejected {
            reason: CloseReason::SelfForward,
            detail: "cannot forward to yourself".into(),
        });
    }
    Ok(())
}

async fn serve_connection(
    config: &ForwardConfig,
    hook: Option<&dyn ConnectHook>,
    stream: TcpStream,
    peer: SocketAddr,
) -> NatterResult<RelayOutcome> {
    if let Some(hook) = hook {
        if let Err(reason) = hook.check(peer) {
            info!(local_peer = %peer, reason = %reason, "connection rejected by hook");
            return Err(NatterError::ForwardRejected {
                reason: CloseReason::PolicyDenied,
                detail: reason,
            });
        }
    }
    debug!(local_peer = %peer, "local connection accepted");
    let (r, w) = stream.into_split();
    forward_stream(config, r, w).await
}

/// Dial the broker, send `ForwardRequest` and wait for a positive ack.
async fn open_session(
    config: &ForwardConfig,
) -> NatterResult<(
    SessionId,
    FrameReader<tokio::net::tcp::OwnedReadHalf>,
    tokio::net::tcp::OwnedWriteHalf,
)> {
    let stream = connect_broker(&config.broker_addr, config.connect_timeout).await?;
    let (r, mut w) = stream.into_split();
    let request = Message::ForwardRequest(ForwardRequestPayload {
        version: PROTOCOL_VERSION,
        source: config.self_name.clone(),
        peer_name: config.peer_name.clone(),
        target_addr: config.peer_target_addr.clone(),
        target_command: config.target_command.clone(),
    });
    write_frame(&mut w, &request).await?;

    let mut reader = FrameReader::new(r, config.max_frame_len);
    let reply = timeout(config.connect_timeout, reader.next_message())
        .await
        .map_err(|_| NatterError::Transport("timed out waiting for ForwardAck".into()))??;

    match reply {
        Some(Message::ForwardAck(ack)) if ack.ok => {
            let sid = ack
                .session_id
                .ok_or_else(|| NatterError::Protocol("ForwardAck without session id".into()))?;
            Ok((sid, reader, w))
        }
        Some(Message::ForwardAck(ack)) => Err(rejection(
            ack.reason.unwrap_or(CloseReason::ProtocolError),
            ack.detail.unwrap_or_default(),
        )),
        Some(other) => Err(NatterError::Protocol(format!(
            "expected ForwardAck, got {}",
            other.name()
        ))),
        None => Err(NatterError::Transport(
            "broker closed connection before ForwardAck".into(),
        )),
    }
}

fn rejection(reason: CloseReason, detail: String) -> NatterError {
    match reason {
        CloseReason::PeerNotFound => NatterError::PeerNotFound(detail),
        CloseReason::PeerUnreachable => NatterError::PeerUnreachable(detail),
        reason => NatterError::ForwardRejected { reason, detail },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn self_forward_is_rejected_before_binding() {
        let config = ForwardConfig::new("bob", "127.0.0.1:1", "127.0.0.1:0", "bob", ":22");
        match Forwarder::bind(config, None).await {
            Err(e) => assert_eq!(e.reason(), CloseReason::SelfForward),
            Ok(_) => panic!("expected SelfForward"),
        }
    }

    #[test]
    fn rejection_maps_lookup_failures() {
        assert!(matches!(
            rejection(CloseReason::PeerNotFound, "bob".into()),
            NatterError::PeerNotFound(_)
        ));
        assert!(matches!(
            rejection(CloseReason::Busy, String::new()),
            NatterError::ForwardRejected { reason: CloseReason::Busy, .. }
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ForwardConfig::new("alice", &addr, "127.0.0.1:0", "bob", ":22");
        let (local, _peer) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(local);
        assert!(matches!(
            forward_stream(&config, r, w).await,
            Err(NatterError::Transport(_))
        ));
    }
}
