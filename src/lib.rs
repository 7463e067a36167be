//! Peer-to-peer filesystem replication over anti-entropy gossip.
//!
//! Each node keeps the full history of every file it has seen
//! ([`versions::VersionStore`]) and a set of known peers
//! ([`sync::PeerDirectory`]). Periodically a node contacts one random peer;
//! the two exchange membership and version metadata, compute which history
//! entries they lack, and pull only that content.

pub mod content;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod versions;

pub use content::{ContentBundler, DirectoryBundler};
pub use sync::{GossipConfig, GossipEngine, Peer, PeerDirectory};
pub use versions::{FileItem, VersionStore};
