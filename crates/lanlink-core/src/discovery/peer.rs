//! Peer records and the liveness table.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// A remote instance seen on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable peer id
    pub id: String,
    /// Display name
    pub name: String,
    /// Address the peer was heard from
    pub address: IpAddr,
    /// Transport port announced by the peer
    pub port: u16,
    /// Last time any message from this peer arrived
    pub last_seen: Instant,
    /// Whether the peer is still in the table
    pub is_online: bool,
}

impl Peer {
    /// Create an online peer seen at `now`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: IpAddr,
        port: u16,
        now: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
            port,
            last_seen: now,
            is_online: true,
        }
    }

    /// Address of the peer's transport listener.
    #[must_use]
    pub fn transport_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether the peer has been silent for longer than `timeout` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Outcome of recording a presence message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The sender was unknown and has been added
    Discovered(Peer),
    /// The sender was known; its last-seen time was refreshed
    Refreshed,
}

/// Remote peers keyed by id.
///
/// A removed peer is gone for good: seeing the same id again creates a new
/// record and reports it as discovered.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence message from `id`.
    pub fn observe(
        &mut self,
        id: &str,
        name: &str,
        address: IpAddr,
        port: u16,
        now: Instant,
    ) -> Observation {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen = now;
            return Observation::Refreshed;
        }

        let peer = Peer::new(id, name, address, port, now);
        self.peers.insert(id.to_string(), peer.clone());
        Observation::Discovered(peer)
    }

    /// Refresh the last-seen time of a known peer. Returns `false` if unknown.
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove a peer, returning its final record.
    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        self.peers.remove(id).map(|mut peer| {
            peer.is_online = false;
            peer
        })
    }

    /// Evict every peer silent for longer than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.is_expired(now, timeout))
            .map(|peer| peer.id.clone())
            .collect();

        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Snapshot of every peer, sorted by name.
    #[must_use]
    pub fn online(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    /// Snapshot of one peer.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).cloned()
    }

    /// Whether `id` is in the table.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_observe_new_then_known() {
        let mut table = PeerTable::new();
        let start = Instant::now();

        let first = table.observe("a1", "Alice", LOCALHOST, 9999, start);
        match first {
            Observation::Discovered(peer) => {
                assert_eq!(peer.id, "a1");
                assert_eq!(peer.port, 9999);
                assert!(peer.is_online);
            }
            Observation::Refreshed => panic!("expected discovery"),
        }

        let later = start + Duration::from_secs(3);
        assert_eq!(
            table.observe("a1", "Alice", LOCALHOST, 9999, later),
            Observation::Refreshed
        );
        assert_eq!(table.get("a1").map(|p| p.last_seen), Some(later));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_once() {
        let mut table = PeerTable::new();
        let start = Instant::now();
        table.observe("a1", "Alice", LOCALHOST, 1, start);
        table.observe("b1", "Bob", LOCALHOST, 2, start + Duration::from_secs(10));

        let timeout = Duration::from_secs(15);
        assert!(table.sweep(start + timeout, timeout).is_empty());

        let now = start + Duration::from_secs(16);
        let evicted = table.sweep(now, timeout);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "a1");
        assert!(!evicted[0].is_online);

        assert!(table.sweep(now, timeout).is_empty());
        assert!(table.contains("b1"));
    }

    #[test]
    fn test_removed_peer_is_rediscovered() {
        let mut table = PeerTable::new();
        let start = Instant::now();
        table.observe("a1", "Alice", LOCALHOST, 1, start);
        assert!(table.remove("a1").is_some());
        assert!(table.remove("a1").is_none());

        let again = table.observe("a1", "Alice", LOCALHOST, 1, start + Duration::from_secs(1));
        assert!(matches!(again, Observation::Discovered(_)));
    }

    #[test]
    fn test_touch_unknown() {
        let mut table = PeerTable::new();
        assert!(!table.touch("ghost", Instant::now()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_online_sorted() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.observe("z", "Zed", LOCALHOST, 1, now);
        table.observe("a", "Amy", LOCALHOST, 2, now);

        let names: Vec<String> = table.online().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Amy", "Zed"]);
    }
}
