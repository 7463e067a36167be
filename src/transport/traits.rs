// Transport Traits and Core Types
// The engine owns message encoding; a transport only moves framed bytes

use crate::sync::Peer;
use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

// ============================================================================
// INBOUND FRAMES
// ============================================================================

/// One framed payload received on the local listening port
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Encoded message bytes
    pub data: Vec<u8>,
    /// Address the connection arrived from (ephemeral port, not the
    /// sender's listener)
    pub from: SocketAddr,
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("No listener at {0}")]
    UnknownPeer(Peer),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Abstract transport for delivering frames to peer listeners.
///
/// Inbound frames are delivered on the channel handed out when the
/// transport is bound.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame to the peer's listening port. Resolves once the
    /// frame has been handed off completely.
    async fn send(&self, peer: &Peer, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Port this transport listens on
    fn local_port(&self) -> u16;
}
