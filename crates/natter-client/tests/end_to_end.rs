//! End-to-end tests: a real broker, listening client and forwarding client on
//! loopback.

use natter_broker::{Broker, BrokerConfig, BrokerState};
use natter_client::{
    ConnectHook, ForwardConfig, Forwarder, ListenConfig, ListeningClient, NatterError,
    NatterResult, TargetPolicy,
};
use natter_core::CloseReason;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_broker(config: BrokerConfig) -> (String, Arc<BrokerState>) {
    let broker = Broker::bind(BrokerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..config
    })
    .await
    .unwrap();
    let addr = broker.local_addr().unwrap().to_string();
    let state = broker.state();
    tokio::spawn(broker.run());
    (addr, state)
}

/// Register `name` and serve in the background.
async fn start_listener(config: ListenConfig) -> JoinHandle<NatterResult<()>> {
    let client = ListeningClient::new(config);
    let registration = client.register().await.unwrap();
    tokio::spawn(async move { client.serve(registration).await })
}

async fn start_forwarder(config: ForwardConfig, hook: Option<Arc<dyn ConnectHook>>) -> (SocketAddr, JoinHandle<NatterResult<()>>) {
    let forwarder = Forwarder::bind(config, hook).await.unwrap();
    let addr = forwarder.local_addr().unwrap();
    (addr, tokio::spawn(forwarder.run()))
}

fn forward_config(broker: &str, peer: &str, target: &str) -> ForwardConfig {
    ForwardConfig::new("alice", broker, "127.0.0.1:0", peer, target)
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn hello_reaches_target_and_echoes_back() {
    let (broker, state) = start_broker(BrokerConfig::default()).await;
    let echo = echo_server().await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;

    let (local, _fwd) = start_forwarder(
        forward_config(&broker, "bob", &format!(":{}", echo.port())),
        None,
    )
    .await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    assert_eq!(state.registry().list().await, vec!["bob".to_string()]);
    assert_eq!(state.sessions().live_count(), 1);
}

#[tokio::test]
async fn binary_payload_round_trips_unchanged() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let echo = echo_server().await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;
    let (local, _fwd) = start_forwarder(
        forward_config(&broker, "bob", &format!("127.0.0.1:{}", echo.port())),
        None,
    )
    .await;

    // Every byte value, well past one relay chunk.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
    let conn = TcpStream::connect(local).await.unwrap();
    let (mut r, mut w) = conn.into_split();

    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        w.write_all(&payload).await.unwrap();
        w
    });

    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, r.read_exact(&mut received)).await.unwrap().unwrap();
    assert_eq!(received, expected);
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn target_close_closes_local_connection() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut s, _) = target.accept().await.unwrap();
        s.write_all(b"hi").await.unwrap();
        // Dropping closes the target side.
    });

    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;
    let (local, _fwd) = start_forwarder(forward_config(&broker, "bob", &format!(":{target_port}")), None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(rest, b"hi");
}

#[tokio::test]
async fn local_close_closes_target_connection() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut s, _) = target.accept().await.unwrap();
        let mut got = Vec::new();
        let _ = s.read_to_end(&mut got).await;
        let _ = done_tx.send(got);
    });

    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;
    let (local, _fwd) = start_forwarder(forward_config(&broker, "bob", &format!(":{target_port}")), None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"bye").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(conn);

    let got = timeout(WAIT, done_rx).await.unwrap().unwrap();
    assert_eq!(got, b"bye");
}

#[tokio::test]
async fn concurrent_duplicate_registration_admits_one() {
    let (broker, state) = start_broker(BrokerConfig::default()).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            ListeningClient::new(ListenConfig::new("bob", &broker))
                .register()
                .await
        }));
    }

    // Hold every result so no winner disconnects before counting.
    let mut results = Vec::new();
    for t in tasks {
        results.push(t.await.unwrap());
    }
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let in_use = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(NatterError::RegistrationFailed { reason: CloseReason::NameInUse, .. })
            )
        })
        .count();
    assert_eq!(ok, 1);
    assert_eq!(in_use, 7);
    assert_eq!(state.registry().count().await, 1);
}

#[tokio::test]
async fn unknown_peer_is_peer_not_found() {
    let (broker, state) = start_broker(BrokerConfig::default()).await;
    let mut config = forward_config(&broker, "nobody", ":22");
    config.listen_once = true;
    let (local, fwd) = start_forwarder(config, None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    let result = timeout(WAIT, fwd).await.unwrap().unwrap();
    assert!(matches!(result, Err(NatterError::PeerNotFound(_))));

    let mut rest = Vec::new();
    let _ = timeout(WAIT, conn.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(state.sessions().pending_count().await, 0);
    assert_eq!(state.sessions().live_count(), 0);
}

#[tokio::test]
async fn dial_failure_is_reported_to_forwarder() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let port = closed_port().await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;

    let mut config = forward_config(&broker, "bob", &format!(":{port}"));
    config.listen_once = true;
    let (local, fwd) = start_forwarder(config, None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    let result = timeout(WAIT, fwd).await.unwrap().unwrap();
    match result {
        Err(NatterError::SessionClosed { reason, .. }) => assert_eq!(reason, CloseReason::DialFailed),
        other => panic!("unexpected {other:?}"),
    }

    let mut rest = Vec::new();
    let _ = timeout(WAIT, conn.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn listen_once_serves_exactly_one_connection() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let echo = echo_server().await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;

    let mut config = forward_config(&broker, "bob", &format!(":{}", echo.port()));
    config.listen_once = true;
    let (local, fwd) = start_forwarder(config, None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"once").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    drop(conn);

    let result = timeout(WAIT, fwd).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(TcpStream::connect(local).await.is_err());
}

#[tokio::test]
async fn hook_rejection_closes_only_that_connection() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let echo = echo_server().await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let hook = move |_peer: SocketAddr| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("first connection refused".to_string())
        } else {
            Ok(())
        }
    };
    let (local, _fwd) = start_forwarder(
        forward_config(&broker, "bob", &format!(":{}", echo.port())),
        Some(Arc::new(hook)),
    )
    .await;

    let mut rejected = TcpStream::connect(local).await.unwrap();
    let mut rest = Vec::new();
    let _ = timeout(WAIT, rejected.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn heartbeats_keep_quiet_sessions_alive() {
    let (broker, state) = start_broker(BrokerConfig {
        idle_timeout: Duration::from_millis(500),
        ..BrokerConfig::default()
    })
    .await;
    let echo = echo_server().await;

    let mut listen = ListenConfig::new("bob", &broker);
    listen.heartbeat_interval = Duration::from_millis(100);
    listen.idle_timeout = Duration::from_millis(500);
    let bob = start_listener(listen).await;

    let mut config = forward_config(&broker, "bob", &format!(":{}", echo.port()));
    config.heartbeat_interval = Duration::from_millis(100);
    config.idle_timeout = Duration::from_millis(500);
    let (local, _fwd) = start_forwarder(config, None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"a").await.unwrap();
    let mut buf = [0u8; 1];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();

    // Stay silent for several idle periods.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!bob.is_finished());
    assert_eq!(state.registry().count().await, 1);
    assert_eq!(state.sessions().pending_count().await, 0);

    conn.write_all(b"b").await.unwrap();
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"b");
}

#[tokio::test]
async fn policy_denial_reaches_forwarder() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let mut listen = ListenConfig::new("bob", &broker);
    listen.policy = TargetPolicy {
        allowed_targets: vec!["10.9.9.9".into()],
        ..TargetPolicy::default()
    };
    let _bob = start_listener(listen).await;

    let mut config = forward_config(&broker, "bob", ":22");
    config.listen_once = true;
    let (local, fwd) = start_forwarder(config, None).await;
    let _conn = TcpStream::connect(local).await.unwrap();

    match timeout(WAIT, fwd).await.unwrap().unwrap() {
        Err(NatterError::SessionClosed { reason, .. }) => assert_eq!(reason, CloseReason::PolicyDenied),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn localhost_pattern_admits_bare_port_target() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let echo = echo_server().await;
    let mut listen = ListenConfig::new("bob", &broker);
    listen.policy = TargetPolicy {
        allowed_targets: vec![format!("localhost:{}", echo.port())],
        ..TargetPolicy::default()
    };
    let _bob = start_listener(listen).await;

    let (local, _fwd) = start_forwarder(
        forward_config(&broker, "bob", &format!(":{}", echo.port())),
        None,
    )
    .await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");
}

#[cfg(unix)]
#[tokio::test]
async fn target_command_relays_stdio() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let mut listen = ListenConfig::new("bob", &broker);
    listen.policy.allow_commands = true;
    let _bob = start_listener(listen).await;

    let mut config = forward_config(&broker, "bob", "");
    config.target_command = vec!["cat".into()];
    let (local, _fwd) = start_forwarder(config, None).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn duplicate_listener_run_fails_with_name_in_use() {
    let (broker, _state) = start_broker(BrokerConfig::default()).await;
    let _bob = start_listener(ListenConfig::new("bob", &broker)).await;

    let second = ListeningClient::new(ListenConfig::new("bob", &broker));
    match timeout(WAIT, second.run()).await.unwrap() {
        Err(NatterError::RegistrationFailed { reason, .. }) => assert_eq!(reason, CloseReason::NameInUse),
        other => panic!("unexpected {other:?}"),
    }
}
