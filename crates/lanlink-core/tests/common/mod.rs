//! Common test utilities for `Lanlink` integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use lanlink_core::config::{
    Config, DiscoveryConfig, IdentityConfig, TransferConfig, TransportConfig,
};
use tokio::sync::{broadcast, mpsc};

/// Base port for tests, incremented for each test to avoid conflicts.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(47600);

/// Loopback address every test binds to.
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// How long tests wait for an expected event.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Get a pair of unique discovery ports for two nodes.
pub fn get_test_ports() -> (u16, u16) {
    let base = TEST_PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Configuration for a loopback node that listens for discovery on
/// `own_port` and announces itself to `peer_port`.
pub fn node_config(id: &str, name: &str, own_port: u16, peer_port: u16) -> Config {
    Config {
        identity: IdentityConfig {
            peer_id: Some(id.to_string()),
            display_name: name.to_string(),
        },
        discovery: DiscoveryConfig {
            port: own_port,
            bind_address: LOCALHOST,
            broadcast_address: LOCALHOST,
            broadcast_port: Some(peer_port),
            broadcast_interval: Duration::from_millis(100),
            peer_timeout: Duration::from_millis(600),
        },
        transport: TransportConfig {
            port: 0,
            bind_address: LOCALHOST,
            max_message_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(2),
        },
        transfer: TransferConfig {
            chunk_size: 16 * 1024,
            chunk_delay: Duration::ZERO,
        },
    }
}

/// Wait until `pick` returns `Some` for an event, skipping everything else.
pub async fn wait_for<E, T, F>(rx: &mut broadcast::Receiver<E>, mut pick: F) -> T
where
    E: Clone,
    F: FnMut(&E) -> Option<T>,
{
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = pick(&event) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Like [`wait_for`], for a single-consumer event queue.
pub async fn wait_for_queued<E, T, F>(rx: &mut mpsc::Receiver<E>, mut pick: F) -> T
where
    F: FnMut(&E) -> Option<T>,
{
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let event = rx.recv().await.expect("event queue closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect every event matching `pick` that arrives within `window`.
pub async fn collect_for<E, T, F>(
    rx: &mut broadcast::Receiver<E>,
    window: Duration,
    mut pick: F,
) -> Vec<T>
where
    E: Clone,
    F: FnMut(&E) -> Option<T>,
{
    let mut found = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(event) = tokio::time::timeout_at(deadline, rx.recv()).await {
        match event {
            Ok(event) => found.extend(pick(&event)),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    found
}
