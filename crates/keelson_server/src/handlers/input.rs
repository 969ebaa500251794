//! The input and reconciliation handler, the algorithmic heart of the
//! server.

use keelson_protocol::messages::{PlayerInput, PlayerInputBatch, PlayerState};
use keelson_protocol::movement::max_step_displacement;
use keelson_protocol::{decode_message, step, ChannelTag, InputData, Packet};
use keelson_transport::PeerId;
use tracing::{debug, warn};

use crate::dispatch::Context;
use crate::server::ServerState;
use crate::session::SessionState;

pub(crate) fn handle_input(ctx: Context<'_>, packet: Packet) {
    let Context { peer, state, .. } = ctx;

    let msg = match decode_message::<PlayerInput>(packet.payload()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%peer, "malformed input: {e:#}");
            state.pool.give(packet);
            return;
        }
    };
    state.pool.give(packet);

    apply_inputs(state, peer, vec![msg.input]);
}

pub(crate) fn handle_input_batch(ctx: Context<'_>, packet: Packet) {
    let Context { peer, state, .. } = ctx;

    let msg = match decode_message::<PlayerInputBatch>(packet.payload()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%peer, "malformed input batch: {e:#}");
            state.pool.give(packet);
            return;
        }
    };
    state.pool.give(packet);

    apply_inputs(state, peer, msg.inputs);
}

/// Applies inputs in ascending sequence order and answers with one
/// reliable snapshot of the final committed state.
fn apply_inputs(state: &mut ServerState, peer: PeerId, mut inputs: Vec<InputData>) {
    let in_game = state
        .registry
        .with_session(peer, |s| s.state == SessionState::InGame)
        .unwrap_or(false);

    if !in_game {
        warn!(%peer, "movement input outside the game");
        state.disconnect(peer, "not authenticated");
        return;
    }

    // Strictly ascending; a batch may arrive shuffled by the sender.
    inputs.sort_unstable_by_key(|input| input.sequence);

    let settings = state.config.movement;
    let dt = state.dt;
    let max_displacement = max_step_displacement(&settings, dt);

    let committed = state.registry.with_session(peer, |session| {
        let mut committed = None;

        for input in &inputs {
            if input.sequence <= session.last_processed_input {
                debug!(
                    %peer,
                    sequence = input.sequence,
                    last = session.last_processed_input,
                    "skipping stale input"
                );
                continue;
            }

            if !input.is_move_valid() {
                warn!(
                    %peer,
                    sequence = input.sequence,
                    magnitude_sq = input.move_dir.length_squared(),
                    "rejecting input with an oversized move vector"
                );
                continue;
            }

            let prev = session.snapshot(input.tick);
            let next = step(&prev, input, &settings, dt);

            let dx = next.position.x - prev.position.x;
            let dz = next.position.z - prev.position.z;
            if (dx * dx + dz * dz).sqrt() > max_displacement {
                warn!(
                    %peer,
                    sequence = input.sequence,
                    "speed violation, keeping previous state"
                );
                continue;
            }

            session.apply_snapshot(&next);
            committed = Some(next);
        }

        committed
    });

    if let Some(Some(snapshot)) = committed {
        state.send_message(peer, &PlayerState { snapshot }, ChannelTag::Reliable);
    }
}
