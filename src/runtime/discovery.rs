//! UDP broadcast discovery.
//!
//! One task owns one UDP socket bound to the discovery port with address
//! sharing enabled (so several instances on one host can coexist). The task
//! announces our presence every [`DISCOVERY_INTERVAL_SECS`], receives peer
//! datagrams, and sends a best-effort goodbye when cancelled.
//!
//! UDP here is best-effort by design: a lost announce is repaired by the
//! next one, a lost goodbye by the peer-timeout reaper. Send errors are
//! swallowed (interfaces come and go); only the initial bind is fatal.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use anyhow::{Context, Result};
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{interval, Duration},
};
use tokio_util::sync::CancellationToken;

use super::protocol::{discovery_kind, DiscoveryMessage, DISCOVERY_INTERVAL_SECS};

/// What the discovery task reports to the runtime worker.
#[derive(Debug)]
pub(crate) enum DiscoveryEvent {
    PeerDiscovered {
        peer_id: String,
        display_name: String,
        device_name: String,
        addr: IpAddr,
        transfer_port: u16,
    },
    PeerGoodbye {
        peer_id: String,
    },
}

/// Bind the discovery socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// available) set *before* binding, via socket2. Cross-platform, no raw
/// `libc`.
pub(crate) fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating discovery socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    // SO_REUSEPORT is missing on Windows; skip it there.
    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("discovery: SO_REUSEPORT failed (non-fatal): {}", e);
    }

    socket.set_broadcast(true).context("setting SO_BROADCAST")?;
    socket.set_nonblocking(true).context("setting non-blocking")?;

    socket
        .bind(&socket2::SockAddr::from(addr))
        .with_context(|| format!("binding discovery port {}", port))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("registering discovery socket with tokio")
}

/// Run the announce/receive loop until cancelled.
///
/// * `peer_id`        — our own id, used to drop reflected broadcasts.
/// * `display_name`   — shared snapshot; a rename shows up in the next announce.
/// * `discovery_port` — destination port for our broadcasts.
pub(crate) async fn run_discovery(
    socket: UdpSocket,
    peer_id: String,
    display_name: Arc<RwLock<String>>,
    device_name: String,
    transfer_port: u16,
    discovery_port: u16,
    events: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    log::info!(
        "discovery started (port={}, transfer_port={})",
        discovery_port,
        transfer_port
    );

    let mut buf = [0u8; 2048];
    let mut tick = interval(Duration::from_secs(DISCOVERY_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = tick.tick() => {
                let msg = DiscoveryMessage::announce(
                    &peer_id,
                    &display_name.read(),
                    &device_name,
                    transfer_port,
                );
                broadcast(&socket, &msg, discovery_port).await;
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src_addr)) => {
                        handle_datagram(&buf[..len], src_addr, &peer_id, &events).await;
                    }
                    Err(e) => {
                        log::warn!("discovery recv error: {}", e);
                    }
                }
            }
        }
    }

    // Best-effort goodbye so peers can drop us without waiting for the reaper.
    let goodbye = DiscoveryMessage::goodbye(
        &peer_id,
        &display_name.read(),
        &device_name,
        transfer_port,
    );
    broadcast(&socket, &goodbye, discovery_port).await;

    log::debug!("discovery stopped");
}

async fn handle_datagram(
    data: &[u8],
    src_addr: SocketAddr,
    own_peer_id: &str,
    events: &mpsc::Sender<DiscoveryEvent>,
) {
    let Some(msg) = DiscoveryMessage::from_bytes(data) else {
        return;
    };
    if !msg.is_valid() {
        return;
    }
    // Our own broadcasts come back on the shared port; ignore them.
    if msg.peer_id == own_peer_id {
        return;
    }

    match msg.kind.as_str() {
        discovery_kind::ANNOUNCE => {
            let _ = events
                .send(DiscoveryEvent::PeerDiscovered {
                    peer_id: msg.peer_id,
                    display_name: msg.display_name,
                    device_name: msg.device_name,
                    addr: src_addr.ip(),
                    transfer_port: msg.transfer_port,
                })
                .await;
        }
        discovery_kind::GOODBYE => {
            let _ = events
                .send(DiscoveryEvent::PeerGoodbye {
                    peer_id: msg.peer_id,
                })
                .await;
        }
        // Unknown kinds are dropped silently.
        _ => {}
    }
}

/// Send `msg` to every broadcast address, swallowing send errors.
async fn broadcast(socket: &UdpSocket, msg: &DiscoveryMessage, port: u16) {
    let data = msg.to_bytes();
    for addr in broadcast_addresses() {
        let dest = SocketAddr::V4(SocketAddrV4::new(addr, port));
        if let Err(e) = socket.send_to(&data, dest).await {
            log::debug!("discovery send to {} failed: {}", dest, e);
        }
    }
}

/// IPv4 broadcast addresses of every non-loopback interface that has one,
/// falling back to the global broadcast address when none are found.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = Vec::new();

    if let Ok(interfaces) = NetworkInterface::show() {
        for iface in interfaces {
            for addr in &iface.addr {
                if let Addr::V4(v4) = addr {
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    if let Some(broadcast) = v4.broadcast {
                        if !addrs.contains(&broadcast) {
                            addrs.push(broadcast);
                        }
                    }
                }
            }
        }
    }

    if addrs.is_empty() {
        addrs.push(Ipv4Addr::BROADCAST);
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_addresses_never_empty() {
        assert!(!broadcast_addresses().is_empty());
    }

    #[tokio::test]
    async fn bind_allows_port_sharing() {
        let a = bind_discovery_socket(0).expect("first bind");
        let port = a.local_addr().unwrap().port();
        let b = bind_discovery_socket(port);
        assert!(b.is_ok(), "second bind on shared port should succeed");
    }

    #[tokio::test]
    async fn own_datagrams_are_filtered() {
        let (tx, mut rx) = mpsc::channel(4);
        let own = DiscoveryMessage::announce("self", "Me", "dev", 1);
        let src: SocketAddr = "127.0.0.1:1000".parse().unwrap();

        handle_datagram(&own.to_bytes(), src, "self", &tx).await;
        assert!(rx.try_recv().is_err());

        let other = DiscoveryMessage::announce("other", "You", "dev2", 2);
        handle_datagram(&other.to_bytes(), src, "self", &tx).await;
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerDiscovered { peer_id, transfer_port, .. } => {
                assert_eq!(peer_id, "other");
                assert_eq!(transfer_port, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_kinds_are_dropped() {
        let (tx, mut rx) = mpsc::channel(4);
        let src: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let json = br#"{"type":"hello","peerId":"x","displayName":"","deviceName":"","transferPort":0}"#;
        handle_datagram(json, src, "self", &tx).await;
        assert!(rx.try_recv().is_err());
    }
}
