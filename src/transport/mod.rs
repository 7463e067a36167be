// Transport module - THE WIRE (abstract)
// Addressed, framed delivery of encoded messages between peer listeners

mod memory;
mod tcp;
mod traits;

pub use traits::{InboundFrame, Transport, TransportError};

pub use tcp::{TcpTransport, TcpTransportConfig};

pub use memory::{MemoryNetwork, MemoryTransport};
