//! Shared fixtures for the integration suite: echo servers, free ports,
//! and managers wired to throwaway state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kubeportal::cache::ClusterCache;
use kubeportal::config::ConfigStore;
use kubeportal::forward::{ForwardDefinition, SocketForward};
use kubeportal::manager::ForwardManager;

/// A socket forward definition pointing at loopback.
pub fn socket_forward(
    name: &str,
    group: &str,
    local_port: u16,
    remote_port: u16,
    enabled: bool,
) -> ForwardDefinition {
    ForwardDefinition::Socket(SocketForward {
        name: name.to_string(),
        group: group.to_string(),
        local_port,
        enabled,
        remote_host: "127.0.0.1".to_string(),
        remote_port,
    })
}

/// Manager over the given store with a fresh cache and shutdown token.
pub fn manager_with_store(store: ConfigStore) -> Arc<ForwardManager> {
    Arc::new(ForwardManager::new(
        store,
        Arc::new(ClusterCache::new()),
        CancellationToken::new(),
    ))
}

/// Manager that never touches disk.
pub fn ephemeral_manager() -> Arc<ForwardManager> {
    manager_with_store(ConfigStore::disabled())
}

/// Echo server accepting any number of connections until aborted.
pub async fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(echo_loop(listener));
    (port, handle)
}

/// Accept loop used by [`spawn_echo_server`]; exposed so tests can run an
/// echo server on a listener they bound themselves.
pub async fn echo_loop(listener: TcpListener) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            break;
        };
        tokio::spawn(async move {
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
    }
}

/// Reserve a free loopback port by binding and dropping a listener.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Connect to a local port, write the payload, and read it back.
pub async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Poll `check` every 25 ms until it passes or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
