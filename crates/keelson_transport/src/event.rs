//! Observable transport events.

use std::fmt;
use std::net::SocketAddr;

use keelson_protocol::Packet;

/// Identifies one admitted peer for the lifetime of its connection.
///
/// Ids are never reused within a process.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// One entry on the transport's ingress queue.
///
/// Events are produced on the transport's socket workers and consumed on
/// the simulation thread via
/// [`process_incoming`](crate::ServerTransport::process_incoming). A
/// `PacketReceived` event transfers ownership of its packet: whoever
/// consumes the event must return the packet to the pool.
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: String,
    },
    PacketReceived {
        peer: PeerId,
        packet: Packet,
    },
    Error {
        message: String,
    },
}
