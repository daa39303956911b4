//! Listening Client: registers a name with the broker and serves forwarded
//! sessions by opening the requested target locally.

use crate::config::ListenConfig;
use crate::net::{connect_broker, dial_target, join_target, parse_target};
use crate::policy::{SessionGuard, TargetPolicyEnforcer};
use natter_core::messages::*;
use natter_core::{
    relay_session, validate_name, write_frame, FrameReader, NatterError, NatterResult, RelayOutcome,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// A registered control connection, ready to [`serve`](ListeningClient::serve).
pub struct Registration {
    /// Our address as the broker sees it.
    pub observed_addr: Option<String>,
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// What a session opened on this side.
enum Target {
    Tcp(TcpStream),
    Command(Child),
}

pub struct ListeningClient {
    config: Arc<ListenConfig>,
    policy: Arc<TargetPolicyEnforcer>,
}

impl ListeningClient {
    pub fn new(config: ListenConfig) -> Self {
        let policy = Arc::new(TargetPolicyEnforcer::new(config.policy.clone()));
        Self {
            config: Arc::new(config),
            policy,
        }
    }

    pub fn policy(&self) -> &Arc<TargetPolicyEnforcer> {
        &self.policy
    }

    /// Register and serve until the control connection ends.
    pub async fn run(&self) -> NatterResult<()> {
        let registration = self.register().await?;
        self.serve(registration).await
    }

    /// Dial the broker and register. A negative ack is returned as
    /// `RegistrationFailed`; there is no retry.
    pub async fn register(&self) -> NatterResult<Registration> {
        let name = &self.config.name;
        validate_name(name).map_err(|detail| NatterError::RegistrationFailed {
            reason: CloseReason::InvalidName,
            detail,
        })?;

        let stream = connect_broker(&self.config.broker_addr, self.config.connect_timeout).await?;
        let (r, mut writer) = stream.into_split();
        write_frame(&mut writer, &register(name)).await?;

        let mut reader = FrameReader::new(r, self.config.max_frame_len);
        let reply = timeout(self.config.connect_timeout, reader.next_message())
            .await
            .map_err(|_| NatterError::Transport("timed out waiting for RegisterAck".into()))??;

        match reply {
            Some(Message::RegisterAck(ack)) if ack.ok => {
                info!(name = %name, broker = %self.config.broker_addr, observed = ?ack.observed_addr, "registered with broker");
                Ok(Registration {
                    observed_addr: ack.observed_addr,
                    reader,
                    writer,
                })
            }
            Some(Message::RegisterAck(ack)) => Err(NatterError::RegistrationFailed {
                reason: ack.reason.unwrap_or(CloseReason::ProtocolError),
                detail: ack.detail.unwrap_or_default(),
            }),
            Some(other) => Err(NatterError::Protocol(format!(
                "expected RegisterAck, got {}",
                other.name()
            ))),
            None => Err(NatterError::Transport(
                "broker closed connection during registration".into(),
            )),
        }
    }

    /// Receive loop: one session task per `ForwardNotify`.
    ///
    /// Session tasks belong to the control connection. When it ends, for any
    /// reason, every session still running is aborted, closing its target
    /// and its data connection.
    ///
    /// # Errors
    ///
    /// `Transport` when the broker closes the control connection,
    /// `IdleTimeout` after `idle_timeout` of silence, `Protocol` on an
    /// unexpected frame.
    pub async fn serve(&self, registration: Registration) -> NatterResult<()> {
        let Registration { reader, writer, .. } = registration;
        let (ctl_tx, ctl_rx) = mpsc::channel(64);
        let writer = tokio::spawn(control_writer(writer, ctl_rx));
        let mut sessions = JoinSet::new();
        let result = self.control_loop(reader, &ctl_tx, &mut sessions).await;
        if !sessions.is_empty() {
            info!(name = %self.config.name, count = sessions.len(), "aborting sessions of closed control connection");
        }
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
        writer.abort();
        if let Err(e) = &result {
            warn!(name = %self.config.name, error = %e, "control connection ended");
        }
        result
    }

    async fn control_loop(
        &self,
        mut reader: FrameReader<OwnedReadHalf>,
        ctl_tx: &mpsc::Sender<Message>,
        sessions: &mut JoinSet<()>,
    ) -> NatterResult<()> {
        let period = self.config.timings().heartbeat_period();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut deadline = Instant::now() + self.config.idle_timeout;

        loop {
            tokio::select! {
                msg = reader.next_message() => {
                    deadline = Instant::now() + self.config.idle_timeout;
                    match msg? {
                        None => {
                            return Err(NatterError::Transport("broker closed control connection".into()))
                        }
                        Some(Message::Heartbeat) => {}
                        Some(Message::ForwardNotify(notify)) => {
                            info!(
                                session = %notify.session_id.short(),
                                source = %notify.source,
                                target = %notify.target_addr,
                                "forward requested"
                            );
                            let config = self.config.clone();
                            let policy = self.policy.clone();
                            let ctl = ctl_tx.clone();
                            sessions.spawn(serve_session(config, policy, ctl, notify));
                        }
                        Some(other) => {
                            return Err(NatterError::Protocol(format!(
                                "unexpected {} on control connection",
                                other.name()
                            )))
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    ctl_tx
                        .send(Message::Heartbeat)
                        .await
                        .map_err(|_| NatterError::Transport("control writer stopped".into()))?;
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = sleep_until(deadline) => return Err(NatterError::IdleTimeout),
            }
        }
    }
}

/// Register `name` with the broker at `broker_address` and serve forwards
/// with default settings.
pub async fn client_listen(name: &str, broker_address: &str) -> NatterResult<()> {
    ListeningClient::new(ListenConfig::new(name, broker_address))
        .run()
        .await
}

async fn control_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            warn!(error = %e, "control write failed");
            break;
        }
    }
}

async fn serve_session(
    config: Arc<ListenConfig>,
    policy: Arc<TargetPolicyEnforcer>,
    ctl: mpsc::Sender<Message>,
    notify: ForwardNotifyPayload,
) {
    let sid = notify.session_id;
    let (target, _guard) = match open_target(&config, &policy, &notify).await {
        Ok(t) => t,
        Err(e) => {
            warn!(session = %sid.short(), target = %notify.target_addr, error = %e, "cannot open target");
            let detail = e.to_string();
            let _ = ctl.send(close(sid, e.reason(), Some(&detail))).await;
            return;
        }
    };

    let result = match target {
        Target::Tcp(stream) => {
            let (r, w) = stream.into_split();
            join_and_relay(&config, &ctl, sid, r, w).await
        }
        Target::Command(mut child) => {
            let io = child.stdout.take().zip(child.stdin.take());
            let result = match io {
                Some((stdout, stdin)) => join_and_relay(&config, &ctl, sid, stdout, stdin).await,
                None => Err(NatterError::Transport("command pipes unavailable".into())),
            };
            // stdin is closed by now; give the command a moment to exit.
            if timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                debug!(session = %sid.short(), "killing target command");
            }
            result
        }
    };

    match result {
        Ok(outcome) => info!(session = %sid.short(), outcome = ?outcome, "session ended"),
        Err(e) => warn!(session = %sid.short(), error = %e, "session ended with error"),
    }
}

async fn open_target(
    config: &ListenConfig,
    policy: &TargetPolicyEnforcer,
    notify: &ForwardNotifyPayload,
) -> NatterResult<(Target, SessionGuard)> {
    let denied = |detail: String| NatterError::ForwardRejected {
        reason: CloseReason::PolicyDenied,
        detail,
    };

    if !notify.target_command.is_empty() {
        let argv = &notify.target_command;
        policy.check_command(argv).map_err(denied)?;
        let guard = policy.try_acquire().map_err(denied)?;
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NatterError::DialFailed(format!("cannot run {}: {e}", argv[0])))?;
        info!(command = %argv.join(" "), "target command started");
        return Ok((Target::Command(child), guard));
    }

    let (host, port) = parse_target(&notify.target_addr).map_err(NatterError::DialFailed)?;
    policy.check_target(&host, port).map_err(denied)?;
    let guard = policy.try_acquire().map_err(denied)?;
    let stream = dial_target(&join_target(&host, port), config.dial_timeout).await?;
    Ok((Target::Tcp(stream), guard))
}

/// Present a data connection for `sid` and relay the local side over it.
async fn join_and_relay<LR, LW>(
    config: &ListenConfig,
    ctl: &mpsc::Sender<Message>,
    sid: SessionId,
    local_r: LR,
    local_w: LW,
) -> NatterResult<RelayOutcome>
where
    LR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
{
    let stream = match connect_broker(&config.broker_addr, config.connect_timeout).await {
        Ok(s) => s,
        Err(e) => {
            let detail = e.to_string();
            let _ = ctl
                .send(close(sid, CloseReason::TransportError, Some(&detail)))
                .await;
            return Err(e);
        }
    };
    let (r, mut w) = stream.into_split();
    write_frame(&mut w, &join(sid)).await?;
    debug!(session = %sid.short(), "joined session");

    relay_session(
        sid,
        local_r,
        local_w,
        FrameReader::new(r, config.max_frame_len),
        w,
        config.timings(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TargetPolicy;

    fn notify(target: &str, command: &[&str]) -> ForwardNotifyPayload {
        ForwardNotifyPayload {
            session_id: SessionId::random(),
            source: "alice".into(),
            target_addr: target.into(),
            target_command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn invalid_name_fails_before_dialing() {
        let client = ListeningClient::new(ListenConfig::new("", "127.0.0.1:1"));
        assert!(matches!(
            client.register().await,
            Err(NatterError::RegistrationFailed { reason: CloseReason::InvalidName, .. })
        ));
    }

    #[tokio::test]
    async fn policy_denial_maps_to_policy_denied() {
        let mut config = ListenConfig::new("bob", "127.0.0.1:1");
        config.policy = TargetPolicy {
            allowed_targets: vec!["10.0.0.1".into()],
            ..TargetPolicy::default()
        };
        let policy = TargetPolicyEnforcer::new(config.policy.clone());

        let err = open_target(&config, &policy, &notify(":22", &[])).await.err().unwrap();
        assert_eq!(err.reason(), CloseReason::PolicyDenied);

        let err = open_target(&config, &policy, &notify("", &["cat"])).await.err().unwrap();
        assert_eq!(err.reason(), CloseReason::PolicyDenied);
        assert_eq!(policy.active_sessions(), 0);
    }

    #[tokio::test]
    async fn refused_target_is_dial_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ListenConfig::new("bob", "127.0.0.1:1");
        let policy = TargetPolicyEnforcer::new(TargetPolicy::default());
        let err = open_target(&config, &policy, &notify(&format!(":{port}"), &[]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.reason(), CloseReason::DialFailed);
        // The guard taken before dialing was released.
        assert_eq!(policy.active_sessions(), 0);
    }

    #[tokio::test]
    async fn closing_control_connection_aborts_sessions() {
        use natter_core::DEFAULT_MAX_FRAME_LEN;
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker.local_addr().unwrap().to_string();
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();

        let client = ListeningClient::new(ListenConfig::new("bob", &broker_addr));
        let policy = client.policy().clone();
        let serving = tokio::spawn(async move { client.run().await });

        let (ctl, _) = broker.accept().await.unwrap();
        let (ctl_r, mut ctl_w) = ctl.into_split();
        let mut ctl_r = FrameReader::new(ctl_r, DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(
            ctl_r.next_message().await.unwrap(),
            Some(Message::Register(_))
        ));
        write_frame(&mut ctl_w, &register_ok(None)).await.unwrap();

        let request = notify(&format!(":{target_port}"), &[]);
        let sid = request.session_id;
        write_frame(&mut ctl_w, &Message::ForwardNotify(request))
            .await
            .unwrap();

        let (mut target_conn, _) = target.accept().await.unwrap();
        let (data, _) = broker.accept().await.unwrap();
        let mut data = FrameReader::new(data, DEFAULT_MAX_FRAME_LEN);
        match data.next_message().await.unwrap() {
            Some(Message::Join(j)) => assert_eq!(j.session_id, sid),
            other => panic!("expected Join, got {other:?}"),
        }
        assert_eq!(policy.active_sessions(), 1);

        // Broker goes away while the session is relaying.
        drop(ctl_r);
        drop(ctl_w);

        let result = timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NatterError::Transport(_))));

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), target_conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "target connection should be closed");
        assert!(!matches!(data.next_message().await, Ok(Some(_))));
        assert_eq!(policy.active_sessions(), 0);
    }
}
