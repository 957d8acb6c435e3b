//! Discovery behavior over loopback-injected datagrams: self-filtering,
//! add/update, goodbye, and the timeout reaper.

mod common;

use std::time::Duration;

use common::*;
use witra::{PeerState, RuntimeEvent};

#[tokio::test]
async fn announce_adds_then_updates() {
    let mut node = spawn_node("Solo").await;

    announce_to(&node, "peer-y", "Yvonne", 40000).await;
    wait_for(&mut node, 5, |event| match event {
        RuntimeEvent::PeerAdded(peer) if peer.id == "peer-y" => {
            assert_eq!(peer.display_name, "Yvonne");
            assert_eq!(peer.transfer_port, 40000);
            assert_eq!(peer.state, PeerState::Discovered);
            Some(())
        }
        _ => None,
    })
    .await;

    // A repeat announce (renamed) updates instead of re-adding.
    announce_to(&node, "peer-y", "Yve", 40000).await;
    wait_for(&mut node, 5, |event| match event {
        RuntimeEvent::PeerAdded(peer) if peer.id == "peer-y" => {
            panic!("duplicate PeerAdded for a known peer")
        }
        RuntimeEvent::PeerUpdated(peer) if peer.id == "peer-y" => {
            assert_eq!(peer.display_name, "Yve");
            Some(())
        }
        _ => None,
    })
    .await;

    let peers = node.handle.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].display_name, "Yve");
}

#[tokio::test]
async fn own_reflected_announce_is_ignored() {
    let mut node = spawn_node("Solo").await;
    let own_id = node.handle.peer_id().to_string();

    // Reflect the node's own identity back at it, as a broadcast would.
    announce_to(&node, &own_id, "Solo", node.transfer_port).await;
    announce_to(&node, &own_id, "Solo", node.transfer_port).await;

    assert_quiet(&mut node, Duration::from_secs(1), |event| {
        matches!(event, RuntimeEvent::PeerAdded(peer) if peer.id == own_id)
    })
    .await;
    assert!(node.handle.list_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn goodbye_removes_peer() {
    let mut node = spawn_node("Solo").await;

    announce_to(&node, "peer-z", "Zoe", 40001).await;
    wait_for(&mut node, 5, |event| match event {
        RuntimeEvent::PeerAdded(peer) if peer.id == "peer-z" => Some(()),
        _ => None,
    })
    .await;

    goodbye_to(&node, "peer-z").await;
    wait_for(&mut node, 5, |event| match event {
        RuntimeEvent::PeerRemoved { peer_id } if peer_id == "peer-z" => Some(()),
        _ => None,
    })
    .await;
    assert!(node.handle.list_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn silent_peer_is_reaped() {
    let mut node = spawn_node("Solo").await;

    announce_to(&node, "peer-w", "Wendy", 40002).await;
    wait_for(&mut node, 5, |event| match event {
        RuntimeEvent::PeerAdded(peer) if peer.id == "peer-w" => Some(()),
        _ => None,
    })
    .await;

    // One announce, then silence: the reaper (every PEER_TIMEOUT/2) must
    // remove the peer once it is PEER_TIMEOUT stale — worst case 15 s.
    wait_for(&mut node, 17, |event| match event {
        RuntimeEvent::PeerRemoved { peer_id } if peer_id == "peer-w" => Some(()),
        _ => None,
    })
    .await;
    assert!(node.handle.list_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn transfer_bind_conflict_surfaces_error() {
    let first = spawn_node("First").await;

    // Second node reuses the first node's TCP port; UDP sharing is fine but
    // the transfer listener must fail and report it.
    let tmp = tempfile::TempDir::new().unwrap();
    let config = witra::runtime::config::Config {
        display_name: Some("Second".to_string()),
        download_path: Some(tmp.path().join("downloads")),
    };
    let (discovery_port, _) = alloc_ports();
    let witra::Runtime { mut events, .. } = witra::spawn_runtime(witra::StartOptions {
        config,
        discovery_port,
        transfer_port: first.transfer_port,
    })
    .await;

    let error = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream ended") {
                RuntimeEvent::Error { message } => break message,
                _ => continue,
            }
        }
    })
    .await
    .expect("no error event");
    assert!(error.contains("transfer server unavailable"), "{}", error);
}
