// Sync module - HOW NODES TALK
// Handles the gossip handshake, peer membership, and version reconciliation

mod gossip;
mod peer;
mod protocol;

pub use gossip::{GossipConfig, GossipEngine, GossipError, GossipStats};
pub use peer::{Peer, PeerDirectory, PeerError};
pub use protocol::{Envelope, Message, MessageKind, ProtocolError};
