// Peer Directory - Known endpoints and random selection for gossip
//
// A deduplicated set of (IP, listening port) pairs. Every mutation is
// flushed to the backing store before returning.

use crate::storage::{SnapshotStore, StoreError};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Peer-related errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Endpoint identity of a node: IP address plus listening port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    ip: IpAddr,
    port: u16,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Long-lived listening port (not the port a connection arrived from)
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Persisted set of known peers
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashSet<Peer>,
    backing: Option<SnapshotStore>,
}

impl PeerDirectory {
    /// Create an empty in-memory directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an unbacked directory from a peer list (e.g. a received snapshot)
    pub fn from_peers<I: IntoIterator<Item = Peer>>(peers: I) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            backing: None,
        }
    }

    /// Load the directory persisted at `path`, or start empty bound to it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PeerError> {
        let backing = SnapshotStore::open(path)?;
        let fresh = backing.is_empty();
        let peers = backing.load_peers()?.unwrap_or_default();
        let stats = backing.stats();
        debug!(
            peers = peers.len(),
            fresh,
            keys = stats.key_count,
            disk_bytes = stats.disk_size_bytes,
            path = %backing.path().display(),
            "loaded peer directory"
        );

        Ok(Self {
            peers: peers.into_iter().collect(),
            backing: Some(backing),
        })
    }

    /// Persist the member set. No-op for in-memory directories.
    pub fn flush(&self) -> Result<(), PeerError> {
        if let Some(backing) = &self.backing {
            backing.save_peers(&self.snapshot())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.contains(peer)
    }

    /// Members in a stable order, for transfer and persistence
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().copied().collect();
        peers.sort();
        peers
    }

    fn add(&mut self, peer: Peer) -> bool {
        let added = self.peers.insert(peer);
        if added {
            info!(%peer, "new peer");
        }
        added
    }

    /// Insert a peer if absent and persist. Returns whether it was new.
    pub fn add_and_flush(&mut self, peer: Peer) -> Result<bool, PeerError> {
        let added = self.add(peer);
        self.flush()?;
        Ok(added)
    }

    /// Union `other` into this directory and persist once.
    /// Returns the number of peers that were new.
    pub fn merge_with(&mut self, other: &PeerDirectory) -> Result<usize, PeerError> {
        let added = other
            .peers
            .iter()
            .filter(|&&peer| self.add(peer))
            .count();
        self.flush()?;
        Ok(added)
    }

    /// Uniformly random member, or `None` when empty
    pub fn select_random(&self) -> Option<Peer> {
        self.peers.iter().copied().choose(&mut rand::thread_rng())
    }

    /// Uniformly random member among those not rejected by `exclude`
    pub fn select_random_excluding<F>(&self, exclude: F) -> Option<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        self.peers
            .iter()
            .copied()
            .filter(|peer| !exclude(peer))
            .choose(&mut rand::thread_rng())
    }
}
