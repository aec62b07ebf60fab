#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Checks that a running bridge is reachable the ways an operator would
//! check it: name resolution, a raw TCP connect and `nc -z`.

use std::time::Duration;

use stdbridge_daemon::{BridgeConfig, BridgeServer, ChildSpec, ListenerHandle};
use tokio::net::TcpStream;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(10);

async fn running_bridge() -> ListenerHandle {
    let config = BridgeConfig::new(0, ChildSpec::new("cat", Vec::<String>::new()))
        .with_host("127.0.0.1");
    BridgeServer::start(config).await.unwrap()
}

#[tokio::test]
async fn localhost_resolves_to_a_loopback_address() {
    let handle = running_bridge().await;
    let port = handle.local_addr().port();

    let addrs: Vec<_> = tokio::net::lookup_host(("localhost", port))
        .await
        .unwrap()
        .collect();
    assert!(!addrs.is_empty());
    assert!(addrs.iter().all(|a| a.ip().is_loopback() && a.port() == port));

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn raw_tcp_connect_succeeds() {
    let handle = running_bridge().await;

    let stream = timeout(STEP, TcpStream::connect(handle.local_addr()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.peer_addr().unwrap(), handle.local_addr());
    drop(stream);

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn netcat_zero_io_connect_succeeds() {
    let Ok(help) = tokio::process::Command::new("nc").arg("-h").output().await else {
        // netcat not installed
        return;
    };
    drop(help);

    let handle = running_bridge().await;
    let port = handle.local_addr().port().to_string();

    let status = timeout(
        STEP,
        tokio::process::Command::new("nc")
            .args(["-z", "127.0.0.1", &port])
            .status(),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(status.success(), "nc -z failed: {status}");

    handle.shutdown();
    timeout(STEP, handle.wait()).await.unwrap().unwrap();
}
