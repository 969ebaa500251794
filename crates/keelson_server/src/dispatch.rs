//! Tagged handler registries for packets and messages.
//!
//! A handler is a function value keyed by its tag, closed over nothing;
//! everything it needs arrives through the [`Context`]. Dispatch is two
//! O(1) lookups: packet kind first, then, for `Data` packets, the peeked
//! message kind. The per-state legality rules of the session machine are
//! enforced here, before any message handler runs.

use std::collections::HashMap;

use keelson_protocol::{peek_message_kind, MessageKind, Packet, PacketKind};
use keelson_transport::PeerId;
use tracing::{debug, warn};

use crate::server::ServerState;

/// What a handler gets to work with. The handler owns the packet and
/// must return it to the pool on every path.
pub struct Context<'a> {
    pub peer: PeerId,
    pub tick: u32,
    pub state: &'a mut ServerState,
}

pub type Handler = Box<dyn FnMut(Context<'_>, Packet) + Send>;

/// The two-level dispatch table.
#[derive(Default)]
pub struct Dispatcher {
    packets: HashMap<PacketKind, Handler>,
    messages: HashMap<MessageKind, Handler>,
    unknown_packets: u64,
    unknown_messages: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet(&mut self, kind: PacketKind, handler: Handler) {
        debug_assert!(
            kind != PacketKind::Data,
            "Data packets dispatch on their message kind"
        );
        self.packets.insert(kind, handler);
    }

    pub fn on_message(&mut self, kind: MessageKind, handler: Handler) {
        self.messages.insert(kind, handler);
    }

    /// Packets and messages that arrived with no handler registered.
    pub fn unknown_counts(&self) -> (u64, u64) {
        (self.unknown_packets, self.unknown_messages)
    }

    /// Routes one received packet. Ownership of the packet ends in the
    /// pool on every path, either here or in the handler.
    pub fn dispatch(&mut self, state: &mut ServerState, peer: PeerId, packet: Packet) {
        if packet.kind == PacketKind::Data {
            self.dispatch_message(state, peer, packet);
            return;
        }

        match self.packets.get_mut(&packet.kind) {
            Some(handler) => {
                let tick = state.current_tick;
                handler(Context { peer, tick, state }, packet);
            }
            None => {
                self.unknown_packets += 1;
                debug!(
                    %peer,
                    kind = ?packet.kind,
                    total = self.unknown_packets,
                    "no handler for packet kind"
                );
                state.pool.give(packet);
            }
        }
    }

    fn dispatch_message(&mut self, state: &mut ServerState, peer: PeerId, packet: Packet) {
        let Some(kind) = peek_message_kind(packet.payload()) else {
            warn!(%peer, "data packet too short to carry a message kind");
            state.pool.give(packet);
            return;
        };

        if kind == MessageKind::Unknown {
            self.unknown_messages += 1;
            warn!(
                %peer,
                total = self.unknown_messages,
                "dropping message with unknown kind"
            );
            state.pool.give(packet);
            return;
        }

        // Session-state legality: before authentication the only legal
        // application message is the join request; everything else is a
        // protocol breach that closes the connection.
        if kind != MessageKind::GameAuthRequest {
            let authenticated = state
                .registry
                .with_session(peer, |s| s.is_authenticated())
                .unwrap_or(false);

            if !authenticated {
                warn!(%peer, ?kind, "application message before authentication");
                state.pool.give(packet);
                state.disconnect(peer, "not authenticated");
                return;
            }
        }

        match self.messages.get_mut(&kind) {
            Some(handler) => {
                let tick = state.current_tick;
                handler(Context { peer, tick, state }, packet);
            }
            None => {
                self.unknown_messages += 1;
                warn!(
                    %peer,
                    ?kind,
                    total = self.unknown_messages,
                    "no handler for message kind"
                );
                state.pool.give(packet);
            }
        }
    }
}
