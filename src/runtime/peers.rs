//! Peer registry.
//!
//! Single-owner map of peers keyed by id, fed by the discovery task and the
//! session lifecycle. The runtime worker owns the registry, applies
//! transitions, and emits the matching `PeerAdded` / `PeerUpdated` /
//! `PeerRemoved` events; nothing here touches a channel.

use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use serde::Serialize;

/// Connection state of a peer, as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Just found on the network.
    Discovered,
    /// We sent a connection request.
    RequestSent,
    /// They sent us a connection request.
    RequestReceived,
    /// Both sides accepted; transfers may flow.
    Connected,
    /// Was connected, lost the connection.
    Disconnected,
}

/// Public snapshot of one peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub display_name: String,
    pub device_name: String,
    pub address: IpAddr,
    pub transfer_port: u16,
    pub state: PeerState,
}

struct PeerRecord {
    display_name: String,
    device_name: String,
    address: IpAddr,
    transfer_port: u16,
    state: PeerState,
    last_seen: Instant,
}

#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer from a discovery announce. Returns `true`
    /// when the peer is new (caller emits `PeerAdded` vs `PeerUpdated`).
    pub fn upsert(
        &mut self,
        peer_id: &str,
        display_name: &str,
        device_name: &str,
        address: IpAddr,
        transfer_port: u16,
    ) -> bool {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.display_name = display_name.to_string();
            record.device_name = device_name.to_string();
            record.address = address;
            record.transfer_port = transfer_port;
            record.last_seen = Instant::now();
            false
        } else {
            self.peers.insert(
                peer_id.to_string(),
                PeerRecord {
                    display_name: display_name.to_string(),
                    device_name: device_name.to_string(),
                    address,
                    transfer_port,
                    state: PeerState::Discovered,
                    last_seen: Instant::now(),
                },
            );
            true
        }
    }

    /// Remove a peer (explicit goodbye). Returns `true` when it existed.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Drop every peer not seen within `timeout`, returning the removed ids.
    pub fn reap(&mut self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let timed_out: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &timed_out {
            self.peers.remove(id);
        }
        timed_out
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(|record| record.state)
    }

    pub fn endpoint(&self, peer_id: &str) -> Option<(IpAddr, u16)> {
        self.peers
            .get(peer_id)
            .map(|record| (record.address, record.transfer_port))
    }

    pub fn display_name(&self, peer_id: &str) -> Option<String> {
        self.peers
            .get(peer_id)
            .map(|record| record.display_name.clone())
    }

    pub fn snapshot(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|record| PeerInfo {
            id: peer_id.to_string(),
            display_name: record.display_name.clone(),
            device_name: record.device_name.clone(),
            address: record.address,
            transfer_port: record.transfer_port,
            state: record.state,
        })
    }

    /// All peers, ordered by id for stable listings.
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut ids: Vec<&String> = self.peers.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    // ── Guarded state transitions ────────────────────────────────────────
    //
    // Each returns `true` when the transition was legal and changed state.

    /// Discovered → RequestSent (we dialed them).
    pub fn request_connect(&mut self, peer_id: &str) -> bool {
        self.transition(peer_id, &[PeerState::Discovered], PeerState::RequestSent)
    }

    /// Discovered / Disconnected → RequestReceived (they dialed us).
    pub fn request_received(&mut self, peer_id: &str) -> bool {
        self.transition(
            peer_id,
            &[PeerState::Discovered, PeerState::Disconnected],
            PeerState::RequestReceived,
        )
    }

    /// RequestSent / RequestReceived → Connected (handshake accepted).
    pub fn mark_connected(&mut self, peer_id: &str) -> bool {
        self.transition(
            peer_id,
            &[PeerState::RequestSent, PeerState::RequestReceived],
            PeerState::Connected,
        )
    }

    /// RequestSent / RequestReceived → Discovered (handshake rejected).
    pub fn mark_rejected(&mut self, peer_id: &str) -> bool {
        self.transition(
            peer_id,
            &[PeerState::RequestSent, PeerState::RequestReceived],
            PeerState::Discovered,
        )
    }

    /// Any in-flight or connected state → Discovered, used when the last
    /// session backing the peer closes.
    pub fn mark_disconnected(&mut self, peer_id: &str) -> bool {
        self.transition(
            peer_id,
            &[
                PeerState::RequestSent,
                PeerState::RequestReceived,
                PeerState::Connected,
                PeerState::Disconnected,
            ],
            PeerState::Discovered,
        )
    }

    fn transition(&mut self, peer_id: &str, from: &[PeerState], to: PeerState) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) if from.contains(&record.state) => {
                record.state = to;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, peer_id: &str, by: Duration) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.last_seen = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))
    }

    #[test]
    fn upsert_reports_new_then_updates() {
        let mut registry = PeerRegistry::new();
        assert!(registry.upsert("p1", "Alice", "laptop", addr(), 45679));
        assert!(!registry.upsert("p1", "Alicia", "laptop", addr(), 45679));

        let info = registry.snapshot("p1").unwrap();
        assert_eq!(info.display_name, "Alicia");
        assert_eq!(info.state, PeerState::Discovered);
    }

    #[test]
    fn legal_connect_path() {
        let mut registry = PeerRegistry::new();
        registry.upsert("p1", "Alice", "laptop", addr(), 45679);

        assert!(registry.request_connect("p1"));
        assert_eq!(registry.state("p1"), Some(PeerState::RequestSent));

        // Cannot send a second request while one is pending.
        assert!(!registry.request_connect("p1"));

        assert!(registry.mark_connected("p1"));
        assert_eq!(registry.state("p1"), Some(PeerState::Connected));

        // Connected peers cannot be accepted again.
        assert!(!registry.mark_connected("p1"));

        assert!(registry.mark_disconnected("p1"));
        assert_eq!(registry.state("p1"), Some(PeerState::Discovered));
    }

    #[test]
    fn reject_returns_to_discovered() {
        let mut registry = PeerRegistry::new();
        registry.upsert("p1", "Alice", "laptop", addr(), 45679);
        assert!(registry.request_received("p1"));
        assert!(registry.mark_rejected("p1"));
        assert_eq!(registry.state("p1"), Some(PeerState::Discovered));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut registry = PeerRegistry::new();
        registry.upsert("p1", "Alice", "laptop", addr(), 45679);

        // Connected only from RequestSent / RequestReceived.
        assert!(!registry.mark_connected("p1"));
        // Unknown peers never transition.
        assert!(!registry.request_connect("ghost"));
        // Discovered is already the resting state.
        assert!(!registry.mark_disconnected("p1"));
    }

    #[test]
    fn reap_removes_only_stale_peers() {
        let mut registry = PeerRegistry::new();
        registry.upsert("old", "Old", "d", addr(), 1);
        registry.upsert("fresh", "Fresh", "d", addr(), 2);
        registry.backdate("old", Duration::from_secs(11));

        let removed = registry.reap(Duration::from_secs(10));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(registry.snapshot("fresh").is_some());
        assert!(registry.snapshot("old").is_none());
    }

    #[test]
    fn goodbye_removes_peer() {
        let mut registry = PeerRegistry::new();
        registry.upsert("p1", "Alice", "laptop", addr(), 45679);
        assert!(registry.remove("p1"));
        assert!(!registry.remove("p1"));
    }
}
