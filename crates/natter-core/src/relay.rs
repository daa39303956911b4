//! Endpoint side of a relay session: pumps bytes between a local stream and a
//! framed broker data connection.
//!
//! Local bytes go out as `DataFrame`s; `DataFrame` payloads from the broker
//! are written to the local stream. A `Heartbeat` is sent every
//! `heartbeat_interval` and any inbound frame resets the idle deadline.

use crate::codec::{write_frame, FrameReader};
use crate::error::{NatterError, NatterResult};
use crate::messages::*;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, warn};

/// Size of one relayed chunk read from the local stream.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Shortest heartbeat period actually used; smaller values are raised to it.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Timing knobs for [`relay_session`].
#[derive(Debug, Clone, Copy)]
pub struct RelayTimings {
    /// How often a `Heartbeat` is sent. Values below
    /// [`MIN_HEARTBEAT_INTERVAL`], including zero, are raised to it.
    pub heartbeat_interval: Duration,
    /// Silence on the broker side longer than this ends the session.
    pub idle_timeout: Duration,
}

impl RelayTimings {
    /// The heartbeat period to schedule, never zero.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }
}

impl Default for RelayTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// How a relay session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The local stream reached EOF; a `Close{closed}` was sent upstream.
    LocalClosed,
    /// The far side ended the session.
    RemoteClosed {
        reason: CloseReason,
        detail: Option<String>,
    },
}

impl RelayOutcome {
    /// Map abnormal remote closes to [`NatterError::SessionClosed`].
    pub fn into_result(self) -> NatterResult<()> {
        match self {
            RelayOutcome::LocalClosed => Ok(()),
            RelayOutcome::RemoteClosed {
                reason: CloseReason::Closed,
                ..
            } => Ok(()),
            RelayOutcome::RemoteClosed { reason, detail } => Err(NatterError::SessionClosed {
                reason,
                detail: detail.unwrap_or_default(),
            }),
        }
    }
}

/// Relay until either side closes.
///
/// `broker` must already be positioned after the session handshake
/// (`ForwardAck` or `Join`). On return the local write half has been shut
/// down; dropping the broker halves closes the data connection.
pub async fn relay_session<LR, LW, BR, BW>(
    session_id: SessionId,
    mut local_r: LR,
    mut local_w: LW,
    mut broker: FrameReader<BR>,
    mut broker_w: BW,
    timings: RelayTimings,
) -> NatterResult<RelayOutcome>
where
    LR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let period = timings.heartbeat_period();
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut deadline = Instant::now() + timings.idle_timeout;

    let result = loop {
        tokio::select! {
            read = local_r.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(session = %session_id.short(), "local stream closed");
                        // Best effort; the broker drops the pair either way.
                        let _ = write_frame(&mut broker_w, &close(session_id, CloseReason::Closed, None)).await;
                        break Ok(RelayOutcome::LocalClosed);
                    }
                    Ok(n) => {
                        if let Err(e) = write_frame(&mut broker_w, &data(&buf[..n])).await {
                            break Err(e);
                        }
                    }
                    Err(e) => {
                        warn!(session = %session_id.short(), error = %e, "local read error");
                        let _ = write_frame(
                            &mut broker_w,
                            &close(session_id, CloseReason::TransportError, Some(&e.to_string())),
                        ).await;
                        break Err(NatterError::Io(e));
                    }
                }
            }
            msg = broker.next_message() => {
                deadline = Instant::now() + timings.idle_timeout;
                match msg {
                    Ok(Some(Message::Data(frame))) => {
                        if let Err(e) = local_w.write_all(&frame.payload).await {
                            warn!(session = %session_id.short(), error = %e, "local write error");
                            let _ = write_frame(
                                &mut broker_w,
                                &close(session_id, CloseReason::TransportError, Some(&e.to_string())),
                            ).await;
                            break Err(NatterError::Io(e));
                        }
                    }
                    Ok(Some(Message::Heartbeat)) => {}
                    Ok(Some(Message::Close(p))) => {
                        debug!(session = %session_id.short(), reason = %p.reason, "remote closed session");
                        break Ok(RelayOutcome::RemoteClosed { reason: p.reason, detail: p.detail });
                    }
                    Ok(Some(other)) => {
                        break Err(NatterError::Protocol(format!(
                            "unexpected {} on data connection",
                            other.name()
                        )));
                    }
                    Ok(None) => {
                        break Err(NatterError::Transport("broker closed data connection".into()));
                    }
                    Err(e) => break Err(e),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = write_frame(&mut broker_w, &Message::Heartbeat).await {
                    break Err(e);
                }
            }
            _ = sleep_until(deadline) => {
                warn!(session = %session_id.short(), "data connection idle timeout");
                let _ = write_frame(&mut broker_w, &close(session_id, CloseReason::IdleTimeout, None)).await;
                break Err(NatterError::IdleTimeout);
            }
        }
    };

    let _ = local_w.shutdown().await;
    result
}
