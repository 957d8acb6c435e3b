//! Shared helpers for the end-to-end tests: spawning runtimes on private
//! ports, injecting discovery datagrams over loopback, waiting on the event
//! stream, and a raw protocol-speaking peer for deterministic timing.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

use tempfile::TempDir;
use tokio::{
    net::{TcpStream, UdpSocket},
    time::timeout,
};

use witra::runtime::config::Config;
use witra::runtime::protocol::{self, DiscoveryMessage, Frame, TransferHeader};
use witra::{spawn_runtime, Runtime, RuntimeEvent, RuntimeHandle, StartOptions};

/// Each test takes a private (discovery, transfer) port pair so instances
/// never cross-talk, mirroring the runtime's `0 → default` convention.
static NEXT_PORT: AtomicU16 = AtomicU16::new(51300);

pub fn alloc_ports() -> (u16, u16) {
    let base = NEXT_PORT.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

pub struct TestNode {
    pub handle: RuntimeHandle,
    pub events: tokio::sync::mpsc::Receiver<RuntimeEvent>,
    pub downloads: PathBuf,
    pub discovery_port: u16,
    pub transfer_port: u16,
    tmp: TempDir,
}

impl TestNode {
    /// A scratch directory for source files, inside the node's tempdir.
    pub fn scratch(&self) -> PathBuf {
        let path = self.tmp.path().join("src");
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

pub async fn spawn_node(name: &str) -> TestNode {
    let (discovery_port, transfer_port) = alloc_ports();
    let tmp = TempDir::new().unwrap();
    let downloads = tmp.path().join("downloads");

    let config = Config {
        display_name: Some(name.to_string()),
        download_path: Some(downloads.clone()),
    };
    let Runtime { handle, events } = spawn_runtime(StartOptions {
        config,
        discovery_port,
        transfer_port,
    })
    .await;

    TestNode {
        handle,
        events,
        downloads,
        discovery_port,
        transfer_port,
        tmp,
    }
}

/// Deliver an `announce` for a (possibly virtual) peer straight to `node`'s
/// discovery socket over loopback.
pub async fn announce_to(node: &TestNode, peer_id: &str, name: &str, transfer_port: u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let msg = DiscoveryMessage::announce(peer_id, name, "test-device", transfer_port);
    socket
        .send_to(&msg.to_bytes(), ("127.0.0.1", node.discovery_port))
        .await
        .unwrap();
}

pub async fn goodbye_to(node: &TestNode, peer_id: &str) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let msg = DiscoveryMessage::goodbye(peer_id, "", "test-device", 0);
    socket
        .send_to(&msg.to_bytes(), ("127.0.0.1", node.discovery_port))
        .await
        .unwrap();
}

/// Pull events until `matcher` yields, panicking after `secs`.
pub async fn wait_for<T>(
    node: &mut TestNode,
    secs: u64,
    mut matcher: impl FnMut(&RuntimeEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(secs), async {
        loop {
            let event = node.events.recv().await.expect("event stream ended");
            if let Some(value) = matcher(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert that no event matching `bad` shows up within the window.
pub async fn assert_quiet(
    node: &mut TestNode,
    window: Duration,
    mut bad: impl FnMut(&RuntimeEvent) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, node.events.recv()).await {
            Ok(Some(event)) => assert!(!bad(&event), "unexpected event: {:?}", event),
            Ok(None) => panic!("event stream ended"),
            Err(_) => break,
        }
    }
}

/// Make `from` visible to `to` (loopback injection of a real node's
/// identity), then drive the request/accept handshake between them.
pub async fn connect_pair(a: &mut TestNode, b: &mut TestNode) {
    let b_id = b.handle.peer_id().to_string();
    let a_id = a.handle.peer_id().to_string();

    announce_to(a, &b_id, &b.handle.display_name(), b.transfer_port).await;
    wait_for(a, 5, |event| match event {
        RuntimeEvent::PeerAdded(peer) if peer.id == b_id => Some(()),
        _ => None,
    })
    .await;

    a.handle.connect(&b_id).await.unwrap();
    wait_for(b, 5, |event| match event {
        RuntimeEvent::ConnectionRequestReceived { peer_id, .. } if *peer_id == a_id => Some(()),
        _ => None,
    })
    .await;

    b.handle.accept(&a_id).await.unwrap();
    wait_for(a, 5, |event| match event {
        RuntimeEvent::ConnectionAccepted { peer_id } if *peer_id == b_id => Some(()),
        _ => None,
    })
    .await;
}

/// A test peer that speaks the wire protocol directly, for scenarios where
/// frame-level timing must be exact (cancel mid-transfer, protocol errors,
/// forced disconnects).
pub struct RawPeer {
    pub stream: TcpStream,
}

impl RawPeer {
    pub async fn connect(transfer_port: u16) -> Self {
        let addr: SocketAddr = format!("127.0.0.1:{}", transfer_port).parse().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream }
    }

    /// Connect and complete the handshake against a real node that accepts.
    pub async fn connect_and_handshake(node: &mut TestNode, peer_id: &str, name: &str) -> Self {
        let mut raw = Self::connect(node.transfer_port).await;
        raw.send_header(&TransferHeader::connection_request(name, peer_id))
            .await;

        let expected = peer_id.to_string();
        wait_for(node, 5, |event| match event {
            RuntimeEvent::ConnectionRequestReceived { peer_id, .. } if *peer_id == expected => {
                Some(())
            }
            _ => None,
        })
        .await;
        node.handle.accept(peer_id).await.unwrap();

        match raw.read_frame().await.expect("accept frame") {
            Frame::Header(header) => {
                assert_eq!(header.kind, protocol::header_kind::CONNECTION_ACCEPT)
            }
            other => panic!("expected connection_accept, got {:?}", other),
        }
        raw
    }

    pub async fn send_header(&mut self, header: &TransferHeader) {
        protocol::write_header(&mut self.stream, header).await.unwrap();
    }

    pub async fn send_data(&mut self, chunk: &[u8]) {
        protocol::write_data(&mut self.stream, chunk).await.unwrap();
    }

    pub async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        protocol::read_frame(&mut self.stream).await
    }
}

/// Deterministic, non-constant file contents.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}
