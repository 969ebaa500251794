//! Ping echo.

use keelson_protocol::messages::{Ping, Pong};
use keelson_protocol::{ChannelTag, Decode, Packet, PacketKind};
use tracing::warn;

use crate::dispatch::Context;

pub(crate) fn handle_ping(ctx: Context<'_>, packet: Packet) {
    let Context { peer, tick, state } = ctx;

    let ping = match Ping::decode(&mut packet.payload()) {
        Ok(ping) => ping,
        Err(e) => {
            warn!(%peer, "malformed ping: {e:#}");
            state.pool.give(packet);
            return;
        }
    };
    state.pool.give(packet);

    state.send_body(
        peer,
        PacketKind::Pong,
        &Pong {
            client_time_ms: ping.client_time_ms,
            server_tick: tick,
        },
        ChannelTag::Unreliable,
    );
}
