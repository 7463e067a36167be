// Protocol - Message types for peer-to-peer reconciliation
//
// Defines the wire format for every message exchanged between nodes:
// - Invitation/AcceptInvitation: bootstrap a link to a new node
// - ConnectRequest/AcceptConnect: start one gossip exchange
// - PeerList/VersionList: membership and version metadata
// - FileRequest/FileData: pull the content a node is missing
//
// Frame layout: [kind tag: u8][listen port: u16 BE][payload]. The tag is
// checked before any payload is parsed.

use crate::sync::peer::Peer;
use crate::versions::FileItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const HEADER_LEN: usize = 3;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unrecognized message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Frame shorter than the message header")]
    Truncated,

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),
}

/// Types of messages in the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Invitation = 1,
    AcceptInvitation = 2,
    ConnectRequest = 3,
    AcceptConnect = 4,
    PeerList = 5,
    VersionList = 6,
    FileRequest = 7,
    FileData = 8,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => MessageKind::Invitation,
            2 => MessageKind::AcceptInvitation,
            3 => MessageKind::ConnectRequest,
            4 => MessageKind::AcceptConnect,
            5 => MessageKind::PeerList,
            6 => MessageKind::VersionList,
            7 => MessageKind::FileRequest,
            8 => MessageKind::FileData,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Invitation => "invitation",
            MessageKind::AcceptInvitation => "accept-invitation",
            MessageKind::ConnectRequest => "connect-request",
            MessageKind::AcceptConnect => "accept-connect",
            MessageKind::PeerList => "peer-list",
            MessageKind::VersionList => "version-list",
            MessageKind::FileRequest => "file-request",
            MessageKind::FileData => "file-data",
        };
        f.write_str(name)
    }
}

/// Every message a node can send
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// "Connect to me"
    Invitation,
    /// Answer to an invitation; the receiver follows with a connect request
    AcceptInvitation,
    /// Request a gossip exchange
    ConnectRequest,
    /// Answer to a connect request; both sides then send metadata
    AcceptConnect,
    /// Sender's peer directory
    PeerList(Vec<Peer>),
    /// Sender's full version history
    VersionList(Vec<FileItem>),
    /// Partial histories whose content the sender wants
    FileRequest(Vec<FileItem>),
    /// Opaque content bundle answering a file request
    FileData(Vec<u8>),
}

impl Message {
    /// Get the message type
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Invitation => MessageKind::Invitation,
            Message::AcceptInvitation => MessageKind::AcceptInvitation,
            Message::ConnectRequest => MessageKind::ConnectRequest,
            Message::AcceptConnect => MessageKind::AcceptConnect,
            Message::PeerList(_) => MessageKind::PeerList,
            Message::VersionList(_) => MessageKind::VersionList,
            Message::FileRequest(_) => MessageKind::FileRequest,
            Message::FileData(_) => MessageKind::FileData,
        }
    }
}

/// A message stamped with its sender's listening port
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    listen_port: u16,
    message: Message,
}

impl Envelope {
    pub fn new(listen_port: u16, message: Message) -> Self {
        Self {
            listen_port,
            message,
        }
    }

    /// Port the sender accepts connections on
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to a frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Vec::with_capacity(HEADER_LEN);
        frame.push(self.kind().tag());
        frame.extend_from_slice(&self.listen_port.to_be_bytes());

        match &self.message {
            Message::Invitation
            | Message::AcceptInvitation
            | Message::ConnectRequest
            | Message::AcceptConnect => {}
            Message::PeerList(peers) => frame.extend(encode_payload(peers)?),
            Message::VersionList(files) | Message::FileRequest(files) => {
                frame.extend(encode_payload(files)?)
            }
            Message::FileData(data) => frame.extend_from_slice(data),
        }

        Ok(frame)
    }

    /// Deserialize from a frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let tag = *frame.first().ok_or(ProtocolError::Truncated)?;
        let kind = MessageKind::try_from(tag)?;

        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        let listen_port = u16::from_be_bytes([frame[1], frame[2]]);
        let payload = &frame[HEADER_LEN..];

        let message = match kind {
            MessageKind::Invitation => Message::Invitation,
            MessageKind::AcceptInvitation => Message::AcceptInvitation,
            MessageKind::ConnectRequest => Message::ConnectRequest,
            MessageKind::AcceptConnect => Message::AcceptConnect,
            MessageKind::PeerList => Message::PeerList(decode_payload(payload)?),
            MessageKind::VersionList => Message::VersionList(decode_payload(payload)?),
            MessageKind::FileRequest => Message::FileRequest(decode_payload(payload)?),
            MessageKind::FileData => Message::FileData(payload.to_vec()),
        };

        Ok(Self {
            listen_port,
            message,
        })
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    postcard::to_allocvec(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ProtocolError> {
    postcard::from_bytes(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
}
