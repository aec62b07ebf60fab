#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests for the TCP bridge.
//!
//! Every test binds `127.0.0.1:0` and relays to ordinary unix tools
//! (`cat`, `sh`, `seq`), so nothing beyond a POSIX userland is needed.

use std::time::Duration;

use stdbridge_core::{ChildExitPolicy, SessionPolicy};
use stdbridge_daemon::{BridgeConfig, BridgeError, BridgeServer, ChildSpec, ListenerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(10);

fn local(child: ChildSpec) -> BridgeConfig {
    BridgeConfig::new(0, child)
        .with_host("127.0.0.1")
        .with_drain_timeout(Duration::from_millis(100))
}

fn cat() -> ChildSpec {
    ChildSpec::new("cat", Vec::<String>::new())
}

fn shell(script: impl Into<String>) -> ChildSpec {
    ChildSpec::new("sh", vec!["-c".to_string(), script.into()])
}

async fn read_exact_within(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(STEP, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

async fn read_to_end_within(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(STEP, stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

async fn wait_for_state(handle: &stdbridge_daemon::ListenerHandle, state: ListenerState) {
    let mut rx = handle.subscribe_state();
    timeout(STEP, rx.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

// =========================================================================
// Listener lifecycle
// =========================================================================

#[tokio::test]
async fn binds_requested_port_and_starts_listening() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();

    assert!(handle.local_addr().ip().is_loopback());
    assert_ne!(handle.local_addr().port(), 0);
    assert_eq!(handle.state(), ListenerState::Listening);
    assert!(!handle.is_finished());

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn port_in_use_is_a_bind_error() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    // The bind fails before the child would be spawned, so a bogus program
    // never surfaces as a spawn error.
    let config = BridgeConfig::new(port, ChildSpec::new("stdbridge-no-such-program", ["x"]))
        .with_host("127.0.0.1");
    let err = BridgeServer::start(config).await.unwrap_err();
    match err {
        BridgeError::Bind { addr, .. } => assert_eq!(addr, format!("127.0.0.1:{port}")),
        other => panic!("expected Bind, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    for policy in [SessionPolicy::Exclusive, SessionPolicy::PerConnection] {
        let config = local(ChildSpec::new("stdbridge-no-such-program", Vec::<String>::new()))
            .with_policy(policy);
        let err = BridgeServer::start(config).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Spawn(_)),
            "{policy}: expected Spawn, got {err:?}"
        );
    }
}

#[tokio::test]
async fn shutdown_disconnects_active_client() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    client.write_all(b"hello\n").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 6).await, b"hello\n");

    handle.shutdown();
    assert!(read_to_end_within(&mut client).await.is_empty());
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_trigger_stops_listener() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();
    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move { trigger.fire() });
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

// =========================================================================
// Relay fidelity
// =========================================================================

#[tokio::test]
async fn echo_round_trip() {
    let handle = stdbridge_daemon::start(0, "cat", Vec::<String>::new())
        .await
        .unwrap();
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], handle.local_addr().port()));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 5).await, b"ping\n");

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn client_bytes_reach_child_stdin_unchanged() {
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("received.bin");
    let child = shell(format!("cat > '{}'", out.display()));
    let handle = BridgeServer::start(
        local(child)
            .with_policy(SessionPolicy::PerConnection)
            .with_drain_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    // Every byte value, several times over, split across odd-sized writes.
    let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 97).collect();
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    for chunk in payload.chunks(1021) {
        client.write_all(chunk).await.unwrap();
    }
    client.shutdown().await.unwrap();

    // The child's stdin closes on client EOF; `cat` exits and the bridge
    // closes the socket once its output ends.
    assert!(read_to_end_within(&mut client).await.is_empty());
    assert_eq!(std::fs::read(&out).unwrap(), payload);

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn child_stdout_reaches_client_unchanged() {
    let handle = BridgeServer::start(
        local(ChildSpec::new("seq", ["1", "20000"])).with_policy(SessionPolicy::PerConnection),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let received = read_to_end_within(&mut client).await;

    let expected: String = (1..=20000).map(|n| format!("{n}\n")).collect();
    assert_eq!(String::from_utf8(received).unwrap(), expected);

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

// =========================================================================
// Session policies
// =========================================================================

#[tokio::test]
async fn client_disconnect_leaves_listener_serving() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    first.write_all(b"one\n").await.unwrap();
    assert_eq!(read_exact_within(&mut first, 4).await, b"one\n");
    drop(first);
    wait_for_state(&handle, ListenerState::Idle).await;

    // Same shared child, fresh client.
    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    second.write_all(b"two\n").await.unwrap();
    assert_eq!(read_exact_within(&mut second, 4).await, b"two\n");
    assert_eq!(handle.state(), ListenerState::Connected);

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn immediate_reconnect_takes_over_shared_child() {
    // A long drain would hold the child for seconds if the departing
    // session did not hand it over to the waiting client.
    let handle = BridgeServer::start(local(cat()).with_drain_timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    first.write_all(b"one\n").await.unwrap();
    assert_eq!(read_exact_within(&mut first, 4).await, b"one\n");
    drop(first);

    let started = std::time::Instant::now();
    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    second.write_all(b"two\n").await.unwrap();
    assert_eq!(read_exact_within(&mut second, 4).await, b"two\n");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "handover took {:?}",
        started.elapsed()
    );

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn late_output_for_previous_client_is_not_delivered() {
    let child = shell("while read l; do sleep 0.3; echo reply-$l; done");
    let handle = BridgeServer::start(local(child)).await.unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    first.write_all(b"secret-of-first\n").await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    second.write_all(b"b\n").await.unwrap();
    assert_eq!(read_exact_within(&mut second, 8).await, b"reply-b\n");

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn exclusive_relays_client_bytes_unchanged() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 97).collect();

    let (mut rd, mut wr) = TcpStream::connect(handle.local_addr())
        .await
        .unwrap()
        .into_split();
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        for chunk in sent.chunks(1021) {
            wr.write_all(chunk).await.unwrap();
        }
        wr
    });

    let mut echoed = vec![0u8; payload.len()];
    timeout(STEP, rd.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
    drop(writer.await.unwrap());

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn exclusive_relays_child_output_unchanged() {
    // Output only starts once a client asks for it; anything earlier would
    // be discarded as written with no client connected.
    let handle = BridgeServer::start(local(shell("read go; seq 1 20000")))
        .await
        .unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    client.write_all(b"go\n").await.unwrap();
    let received = read_to_end_within(&mut client).await;

    let expected: String = (1..=20000).map(|n| format!("{n}\n")).collect();
    assert_eq!(String::from_utf8(received).unwrap(), expected);

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn exclusive_rejects_second_client() {
    let handle = BridgeServer::start(local(cat())).await.unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    first.write_all(b"mine\n").await.unwrap();
    assert_eq!(read_exact_within(&mut first, 5).await, b"mine\n");

    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(read_to_end_within(&mut second).await.is_empty());

    // The first session is untouched.
    first.write_all(b"still\n").await.unwrap();
    assert_eq!(read_exact_within(&mut first, 6).await, b"still\n");

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn per_connection_serves_clients_concurrently() {
    let handle = BridgeServer::start(
        local(cat())
            .with_policy(SessionPolicy::PerConnection)
            .with_max_sessions(2),
    )
    .await
    .unwrap();

    let mut a = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut b = TcpStream::connect(handle.local_addr()).await.unwrap();
    a.write_all(b"from-a\n").await.unwrap();
    b.write_all(b"from-b\n").await.unwrap();
    assert_eq!(read_exact_within(&mut b, 7).await, b"from-b\n");
    assert_eq!(read_exact_within(&mut a, 7).await, b"from-a\n");

    // Pool is full.
    let mut c = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(read_to_end_within(&mut c).await.is_empty());

    // A slot frees up once a session ends.
    drop(a);
    let mut d = None;
    for _ in 0..50 {
        let mut candidate = TcpStream::connect(handle.local_addr()).await.unwrap();
        if candidate.write_all(b"from-d\n").await.is_err() {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }
        let mut buf = [0u8; 7];
        if let Ok(Ok(_)) = timeout(Duration::from_millis(500), candidate.read_exact(&mut buf)).await
        {
            assert_eq!(&buf, b"from-d\n");
            d = Some(candidate);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(d.is_some(), "no slot freed after first client left");

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

// =========================================================================
// Child exit
// =========================================================================

#[tokio::test]
async fn child_exit_with_shutdown_policy_stops_listener() {
    let handle = BridgeServer::start(
        local(shell("exit 0")).with_child_exit_policy(ChildExitPolicy::Shutdown),
    )
    .await
    .unwrap();

    let err = timeout(STEP, handle.wait()).await.unwrap().unwrap_err();
    assert!(
        matches!(err, BridgeError::ChildExited { .. }),
        "expected ChildExited, got {err:?}"
    );
}

#[tokio::test]
async fn child_exit_with_keep_listening_refuses_clients() {
    let handle = BridgeServer::start(local(shell("exit 0"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(read_to_end_within(&mut client).await.is_empty());
    assert!(!handle.is_finished());

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}
