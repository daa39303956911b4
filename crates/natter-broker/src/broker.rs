//! Broker engine: accept loop, per-connection handler and the raw relay pump.
//!
//! Every accepted connection is classified by its first frame:
//!
//! - `Register` makes it a control connection for a Listening Client.
//! - `ForwardRequest` makes it the requester side of a new session.
//! - `Join` makes it the listener side of a pending session.
//!
//! Once both sides of a session are present the broker copies raw bytes
//! between them; the endpoints speak the frame protocol end to end.

use crate::config::BrokerConfig;
use crate::registry::{ConnectionRegistry, ControlHandle, Outbound};
use crate::sessions::{SessionEvent, SessionTable};
use natter_core::messages::*;
use natter_core::relay::RELAY_CHUNK_SIZE;
use natter_core::{read_frame, validate_name, write_frame, FrameReader, NatterError, NatterResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a closing connection is drained so the peer reads our last frame.
const LINGER: Duration = Duration::from_secs(2);

/// Any byte stream the broker can serve.
pub trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

pub type BoxedStream = Box<dyn BrokerStream>;

/// A bound broker, ready to [`run`](Broker::run).
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: BrokerConfig) -> NatterResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| NatterError::Transport(format!("bind {}: {e}", config.bind_addr)))?;
        Ok(Self {
            listener,
            state: Arc::new(BrokerState::new(config)),
        })
    }

    pub fn local_addr(&self) -> NatterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<BrokerState> {
        self.state.clone()
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self) -> NatterResult<()> {
        info!(addr = %self.local_addr()?, "broker listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        state.serve(Box::new(stream), remote).await;
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// State shared by every connection handler.
pub struct BrokerState {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionTable>,
    next_conn_id: AtomicU64,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        let sessions = Arc::new(SessionTable::new(config.max_sessions));
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            sessions,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Serve one accepted connection until it ends.
    pub async fn serve(&self, mut stream: BoxedStream, remote: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        debug!(remote = %remote, conn = conn_id, "connection accepted");

        let first = match timeout(
            self.config.handshake_timeout,
            read_frame(&mut stream, self.config.max_frame_len),
        )
        .await
        {
            Err(_) => {
                debug!(remote = %remote, "no first frame before handshake timeout");
                return;
            }
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                debug!(remote = %remote, "closed before first frame");
                return;
            }
            Ok(Err(e)) => {
                warn!(remote = %remote, error = %e, "bad first frame");
                return;
            }
        };

        let result = match first {
            Message::Register(p) => self.handle_register(stream, remote, conn_id, p).await,
            Message::ForwardRequest(p) => self.handle_forward(stream, remote, p).await,
            Message::Join(p) => self.handle_join(stream, remote, p).await,
            other => Err(NatterError::Protocol(format!(
                "unexpected first frame {}",
                other.name()
            ))),
        };
        if let Err(e) = result {
            warn!(remote = %remote, conn = conn_id, error = %e, "connection ended with error");
        }
    }

    // ── Registered (control) connections ─────────────────────────────

    async fn handle_register(
        &self,
        mut stream: BoxedStream,
        remote: SocketAddr,
        conn_id: u64,
        p: RegisterPayload,
    ) -> NatterResult<()> {
        if p.version > PROTOCOL_VERSION {
            let detail = format!("protocol version {} not supported", p.version);
            write_frame(&mut stream, &register_fail(CloseReason::UnsupportedVersion, &detail)).await?;
            return Err(NatterError::Protocol(detail));
        }
        if let Err(detail) = validate_name(&p.name) {
            info!(remote = %remote, "registration rejected: {detail}");
            write_frame(&mut stream, &register_fail(CloseReason::InvalidName, &detail)).await?;
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(64);
        let handle = ControlHandle::new(conn_id, remote, tx);
        if let Err(e) = self.registry.register(&p.name, handle.clone()).await {
            info!(peer = %p.name, remote = %remote, "registration rejected: name in use");
            write_frame(&mut stream, &register_fail(e.reason(), &e.to_string())).await?;
            return Ok(());
        }
        if let Err(e) = write_frame(&mut stream, &register_ok(Some(remote.to_string()))).await {
            self.registry.remove(&p.name, conn_id).await;
            return Err(e);
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(control_writer(write_half, rx, p.name.clone()));
        let reader = FrameReader::new(read_half, self.config.max_frame_len);
        let result = self.control_loop(&p.name, reader, &handle).await;

        // Stop the writer first so no late notify is acked, then unpublish
        // the name before cancelling what is anchored to it.
        writer.abort();
        drop(handle);
        self.registry.remove(&p.name, conn_id).await;
        let cancelled = self
            .sessions
            .cancel_owner(&p.name, CloseReason::PeerUnreachable)
            .await;

        match result {
            Ok(()) => info!(peer = %p.name, cancelled, "listener disconnected"),
            Err(e) => info!(peer = %p.name, cancelled, error = %e, "listener dropped"),
        }
        Ok(())
    }

    async fn control_loop<R: AsyncRead + Unpin>(
        &self,
        name: &str,
        mut reader: FrameReader<R>,
        handle: &ControlHandle,
    ) -> NatterResult<()> {
        loop {
            let msg = match timeout(self.config.idle_timeout, reader.next_message()).await {
                Err(_) => return Err(NatterError::IdleTimeout),
                Ok(msg) => msg?,
            };
            match msg {
                None => return Ok(()),
                Some(Message::Heartbeat) => handle.post(Message::Heartbeat).await?,
                Some(Message::Close(p)) => {
                    let failed = self
                        .sessions
                        .fail(&p.session_id, name, p.reason, p.detail.clone())
                        .await;
                    if failed {
                        info!(peer = %name, session = %p.session_id.short(), reason = %p.reason, "listener refused session");
                    } else {
                        debug!(peer = %name, session = %p.session_id.short(), "close for unknown session ignored");
                    }
                }
                Some(other) => {
                    return Err(NatterError::Protocol(format!(
                        "unexpected {} on control connection",
                        other.name()
                    )))
                }
            }
        }
    }

    // ── Requester side of a session ──────────────────────────────────

    async fn handle_forward(
        &self,
        mut stream: BoxedStream,
        remote: SocketAddr,
        p: ForwardRequestPayload,
    ) -> NatterResult<()> {
        if p.version > PROTOCOL_VERSION {
            let detail = format!("protocol version {} not supported", p.version);
            write_frame(&mut stream, &forward_fail(CloseReason::UnsupportedVersion, &detail)).await?;
            return Err(NatterError::Protocol(detail));
        }
        if !p.source.is_empty() && p.source == p.peer_name {
            info!(remote = %remote, peer = %p.peer_name, "rejected forward to self");
            write_frame(
                &mut stream,
                &forward_fail(CloseReason::SelfForward, "cannot forward to yourself"),
            )
            .await?;
            return Ok(());
        }

        let peer = match self.registry.lookup(&p.peer_name).await {
            Ok(h) => h,
            Err(e) => {
                info!(remote = %remote, peer = %p.peer_name, "forward rejected: peer not found");
                write_frame(&mut stream, &forward_fail(e.reason(), &e.to_string())).await?;
                return Ok(());
            }
        };

        // `_slot` keeps the session counted until this handler returns.
        let (sid, rx, _slot) = match self.sessions.open(&p.peer_name).await {
            Ok(v) => v,
            Err(e) => {
                warn!(remote = %remote, peer = %p.peer_name, error = %e, "forward rejected");
                write_frame(&mut stream, &forward_fail(e.reason(), &e.to_string())).await?;
                return Ok(());
            }
        };

        let notify = Message::ForwardNotify(ForwardNotifyPayload {
            session_id: sid,
            source: p.source.clone(),
            target_addr: p.target_addr.clone(),
            target_command: p.target_command.clone(),
        });
        if let Err(e) = peer.send(notify).await {
            self.sessions.discard(&sid).await;
            warn!(peer = %p.peer_name, session = %sid.short(), error = %e, "could not notify listener");
            write_frame(
                &mut stream,
                &forward_fail(CloseReason::PeerUnreachable, &e.to_string()),
            )
            .await?;
            return Ok(());
        }
        // The listener may have gone between lookup and open. Its teardown
        // unpublishes the name before cancelling, so a session opened after
        // the cancel is caught here.
        if !self.registry.is_current(&p.peer_name, peer.connection_id).await {
            self.sessions.discard(&sid).await;
            info!(peer = %p.peer_name, session = %sid.short(), "listener left during setup");
            write_frame(
                &mut stream,
                &forward_fail(CloseReason::PeerUnreachable, "peer disconnected"),
            )
            .await?;
            return Ok(());
        }

        if let Err(e) = write_frame(&mut stream, &forward_ok(sid)).await {
            self.sessions.discard(&sid).await;
            return Err(e);
        }
        info!(
            session = %sid.short(),
            source = %p.source,
            peer = %p.peer_name,
            target = %p.target_addr,
            "session pending"
        );

        let event = match timeout(self.config.session_setup_timeout, rx).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => SessionEvent::Failed {
                reason: CloseReason::PeerUnreachable,
                detail: None,
            },
            Err(_) => {
                self.sessions.discard(&sid).await;
                SessionEvent::Failed {
                    reason: CloseReason::SetupTimeout,
                    detail: Some("listener did not join in time".into()),
                }
            }
        };

        match event {
            SessionEvent::Joined {
                stream: peer_stream,
                cancel,
            } => {
                info!(session = %sid.short(), "session relaying");
                let stats = pump(stream, peer_stream, self.config.idle_timeout, cancel).await;
                self.sessions.discard(&sid).await;
                match stats.cancelled {
                    Some(reason) => info!(
                        session = %sid.short(),
                        reason = %reason,
                        bytes_up = stats.a_to_b,
                        bytes_down = stats.b_to_a,
                        "session cancelled"
                    ),
                    None => info!(
                        session = %sid.short(),
                        bytes_up = stats.a_to_b,
                        bytes_down = stats.b_to_a,
                        "session ended"
                    ),
                }
            }
            SessionEvent::Failed { reason, detail } => {
                info!(session = %sid.short(), reason = %reason, "session failed before relay");
                close_with(&mut stream, &close(sid, reason, detail.as_deref())).await?;
            }
        }
        Ok(())
    }

    // ── Listener side of a session ───────────────────────────────────

    async fn handle_join(
        &self,
        mut stream: BoxedStream,
        remote: SocketAddr,
        p: JoinPayload,
    ) -> NatterResult<()> {
        let sid = p.session_id;
        let Some((tx, cancel)) = self.sessions.claim(&sid).await else {
            warn!(remote = %remote, session = %sid.short(), "join for unknown session");
            return close_with(&mut stream, &close(sid, CloseReason::UnknownSession, None)).await;
        };
        debug!(remote = %remote, session = %sid.short(), "listener joined");

        if let Err(SessionEvent::Joined { mut stream, .. }) =
            tx.send(SessionEvent::Joined { stream, cancel })
        {
            self.sessions.discard(&sid).await;
            return close_with(
                &mut stream,
                &close(sid, CloseReason::UnknownSession, Some("requester gone")),
            )
            .await;
        }
        Ok(())
    }
}

/// Serialize queued frames onto a control connection, acking each write.
async fn control_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    peer: String,
) {
    while let Some(out) = rx.recv().await {
        let result = write_frame(&mut writer, &out.msg).await;
        if let Some(ack) = out.ack {
            let _ = ack.send(result.is_ok());
        }
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "control write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Write a final frame, half-close, and drain until the peer hangs up.
async fn close_with<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, msg: &Message) -> NatterResult<()> {
    write_frame(stream, msg).await?;
    let _ = stream.shutdown().await;
    drain(stream, LINGER).await;
    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R, limit: Duration) {
    let mut buf = [0u8; 1024];
    let _ = timeout(limit, async {
        while let Ok(n) = reader.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Byte counts and cancellation cause of one finished [`pump`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Set when the session was cancelled rather than ended by a stream.
    pub cancelled: Option<CloseReason>,
}

/// Copy bytes between two data connections until either direction ends or
/// the session is cancelled.
///
/// # Arguments
///
/// * `a`, `b` - the requester's and the listener's data connections.
/// * `idle_timeout` - bound on every single read and write.
/// * `cancel` - fires when the session's owner goes away. A dropped sender
///   does not stop the pump.
///
/// When the pump stops both connections are half-closed, drained briefly
/// and dropped.
pub async fn pump<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    cancel: oneshot::Receiver<CloseReason>,
) -> PumpStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    let mut up = 0u64;
    let mut down = 0u64;
    let cancel_signal = async move {
        match cancel.await {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    };

    let cancelled = tokio::select! {
        r = copy_with_idle(&mut ar, &mut bw, idle_timeout, &mut up) => {
            if let Err(e) = r {
                debug!(error = %e, "relay a->b ended");
            }
            None
        }
        r = copy_with_idle(&mut br, &mut aw, idle_timeout, &mut down) => {
            if let Err(e) = r {
                debug!(error = %e, "relay b->a ended");
            }
            None
        }
        reason = cancel_signal => Some(reason),
    };

    let _ = tokio::join!(aw.shutdown(), bw.shutdown());
    tokio::join!(drain(&mut ar, LINGER), drain(&mut br, LINGER));
    PumpStats {
        a_to_b: up,
        b_to_a: down,
        cancelled,
    }
}

async fn copy_with_idle<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    total: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let idle_err = || std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout");
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| idle_err())??;
        if n == 0 {
            return Ok(());
        }
        timeout(idle, async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| idle_err())??;
        *total += n as u64;
    }
}
