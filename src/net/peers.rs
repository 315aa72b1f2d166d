//! Directory of peers discovered on the local network.
//!
//! Peers are keyed by their network address: a later announcement from the
//! same address overwrites the stored signature and port instead of adding a
//! second entry. The directory is mutated only by the discovery service and
//! handed out to callers as cloned snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

/// Number of ports kept inline when collecting peer ports.
pub const INLINE_PORTS: usize = 4;

/// A remote instance that announced itself via discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Host identifier the announcement came from (e.g. `192.168.1.20`).
    pub address: Arc<str>,
    /// Human-readable identity, e.g. `alice at laptop (Linux)`.
    pub signature: Arc<str>,
    /// Port the peer announced (the well-known port if none was given).
    pub port: u16,
}

impl Peer {
    #[inline]
    pub fn new(address: impl AsRef<str>, signature: impl AsRef<str>, port: u16) -> Self {
        Self {
            address: Arc::from(address.as_ref()),
            signature: Arc::from(signature.as_ref()),
            port,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}:{}]", self.signature, self.address, self.port)
    }
}

/// Result of inserting a peer into the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No peer was known at this address.
    Added,
    /// An existing entry was overwritten.
    Updated,
}

/// Thread-safe map of known peers keyed by address.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<Arc<str>, Peer>>,
}

impl PeerDirectory {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the peer stored under `peer.address`.
    pub fn upsert(&self, peer: Peer) -> Upsert {
        let mut peers = self.peers.write();
        match peers.insert(Arc::clone(&peer.address), peer) {
            Some(_) => Upsert::Updated,
            None => Upsert::Added,
        }
    }

    /// Removes and returns the peer at `address`, if known.
    pub fn remove(&self, address: &str) -> Option<Peer> {
        self.peers.write().remove(address)
    }

    pub fn get(&self, address: &str) -> Option<Peer> {
        self.peers.read().get(address).cloned()
    }

    #[inline]
    pub fn contains(&self, address: &str) -> bool {
        self.peers.read().contains_key(address)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Returns a copy of all peers, ordered by address.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Returns every distinct port announced by a known peer, ascending.
    pub fn known_ports(&self) -> SmallVec<[u16; INLINE_PORTS]> {
        let mut ports: SmallVec<[u16; INLINE_PORTS]> =
            self.peers.read().values().map(|peer| peer.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}
