//! The pending-input buffer, predicted-state ring, and reconciliation.

use std::collections::VecDeque;

use glam::Vec2;
use keelson_protocol::{step, InputData, InputFlags, MovementSettings, StateSnapshot};
use tracing::debug;

/// Ring capacity in ticks. At 30 Hz this is over four seconds of
/// predictions, far beyond any snapshot round trip worth reconciling.
const RING_SIZE: usize = 128;

/// A measured disagreement between prediction and authority.
#[derive(Clone, Debug)]
pub struct Misprediction {
    /// The tick at which prediction and authority disagreed.
    pub tick: u32,
    /// What the client had predicted for that tick, if the ring still
    /// held it.
    pub predicted: Option<StateSnapshot>,
    /// The authoritative snapshot that contradicted it.
    pub authoritative: StateSnapshot,
    /// The corrected present state after replaying pending inputs.
    pub corrected: StateSnapshot,
    /// How many pending inputs were replayed on top of the
    /// authoritative state.
    pub replayed: usize,
}

/// Client-side prediction state for one player.
pub struct Predictor {
    settings: MovementSettings,
    dt: f32,
    epsilon: f32,
    sequence: u32,
    current: StateSnapshot,
    /// Inputs sent but not yet acknowledged by a snapshot.
    pending: VecDeque<InputData>,
    /// Predicted post-step state per tick, indexed by `tick % RING_SIZE`.
    ring: Box<[Option<StateSnapshot>; RING_SIZE]>,
}

impl Predictor {
    /// `epsilon` is the positional tolerance below which an
    /// authoritative snapshot counts as agreeing with the prediction.
    pub fn new(settings: MovementSettings, tick_rate: u32, epsilon: f32) -> Self {
        Self {
            settings,
            dt: 1.0 / tick_rate as f32,
            epsilon,
            sequence: 0,
            current: StateSnapshot::spawn(0),
            pending: VecDeque::new(),
            ring: Box::new([None; RING_SIZE]),
        }
    }

    /// The locally predicted present state.
    pub fn current(&self) -> &StateSnapshot {
        &self.current
    }

    /// The sequence of the most recently produced input.
    pub fn last_sequence(&self) -> u32 {
        self.sequence
    }

    /// Number of inputs awaiting acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Resets to an authoritative state, e.g. on (re)join. Drops all
    /// pending inputs and predictions.
    pub fn reset_to(&mut self, state: StateSnapshot) {
        self.current = state;
        self.pending.clear();
        self.ring.fill(None);
    }

    /// Samples one tick of intent: assigns the next sequence, applies the
    /// shared movement step locally, records the prediction, and returns
    /// the input for sending.
    pub fn predict(
        &mut self,
        tick: u32,
        move_dir: Vec2,
        rotation: f32,
        flags: InputFlags,
    ) -> InputData {
        self.sequence += 1;

        let input = InputData {
            tick,
            sequence: self.sequence,
            move_dir,
            rotation,
            flags,
        };

        self.current = step(&self.current, &input, &self.settings, self.dt);
        self.pending.push_back(input);
        self.ring[tick as usize % RING_SIZE] = Some(self.current);

        input
    }

    /// Applies an authoritative snapshot.
    ///
    /// Pending inputs at or below `snapshot.last_processed_input` are
    /// dropped. If the prediction recorded for `snapshot.tick` agrees
    /// within tolerance, nothing else happens. Otherwise the present is
    /// rebuilt by replaying every still-pending input on top of the
    /// snapshot, and the divergence is reported.
    pub fn reconcile(&mut self, snapshot: &StateSnapshot) -> Option<Misprediction> {
        let acked = snapshot.last_processed_input;

        while let Some(front) = self.pending.front() {
            if front.sequence <= acked {
                self.pending.pop_front();
            } else {
                break;
            }
        }

        let predicted = self.ring[snapshot.tick as usize % RING_SIZE]
            .filter(|p| p.tick == snapshot.tick);

        if let Some(predicted) = predicted {
            if self.agrees(&predicted, snapshot) {
                return None;
            }
        }

        // Rewind to authority and replay what the server has not seen.
        let mut corrected = *snapshot;
        for input in &self.pending {
            corrected = step(&corrected, input, &self.settings, self.dt);
        }

        let replayed = self.pending.len();
        self.current = corrected;
        self.ring[corrected.tick as usize % RING_SIZE] = Some(corrected);

        debug!(
            tick = snapshot.tick,
            replayed, "misprediction reconciled against authoritative state"
        );

        Some(Misprediction {
            tick: snapshot.tick,
            predicted,
            authoritative: *snapshot,
            corrected,
            replayed,
        })
    }

    fn agrees(&self, predicted: &StateSnapshot, authoritative: &StateSnapshot) -> bool {
        predicted.position.distance_squared(authoritative.position)
            <= self.epsilon * self.epsilon
            && predicted
                .velocity
                .distance_squared(authoritative.velocity)
                <= self.epsilon * self.epsilon
            && (predicted.rotation - authoritative.rotation).abs() <= self.epsilon
            && predicted.flags == authoritative.flags
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use keelson_protocol::StateFlags;

    use super::*;

    const TICK_RATE: u32 = 30;
    const DT: f32 = 1.0 / 30.0;
    const EPSILON: f32 = 0.01;

    fn predictor() -> Predictor {
        Predictor::new(MovementSettings::default(), TICK_RATE, EPSILON)
    }

    /// The server side of the loop, applying identical physics.
    fn server_apply(state: &StateSnapshot, input: &InputData) -> StateSnapshot {
        step(state, input, &MovementSettings::default(), DT)
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut p = predictor();

        let a = p.predict(1, Vec2::ZERO, 0.0, InputFlags::new());
        let b = p.predict(2, Vec2::ZERO, 0.0, InputFlags::new());

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(p.pending_len(), 2);
    }

    #[test]
    fn agreement_produces_no_misprediction() {
        let mut client = predictor();
        let mut server_state = StateSnapshot::spawn(0);

        // Five forward inputs, server applies the very same physics.
        let mut last_input = None;
        for tick in 1..=5 {
            let input = client.predict(tick, Vec2::new(0.0, 1.0), 0.0, InputFlags::new());
            server_state = server_apply(&server_state, &input);
            last_input = Some(input);
        }

        assert_eq!(last_input.unwrap().sequence, 5);
        assert_relative_eq!(
            server_state.position.z,
            5.0 * MovementSettings::default().walk_speed * DT,
            epsilon = 1e-5
        );

        let miss = client.reconcile(&server_state);
        assert!(miss.is_none(), "identical simulations must agree");
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn divergence_replays_pending_inputs() {
        let mut client = predictor();
        let mut server_state = StateSnapshot::spawn(0);

        let mut inputs = Vec::new();
        for tick in 1..=4 {
            let input = client.predict(tick, Vec2::new(0.0, 1.0), 0.0, InputFlags::new());
            inputs.push(input);
        }

        // Server processed inputs 1 and 2, but its state for tick 2
        // diverged (it compensated a lost tick with different velocity).
        server_state = server_apply(&server_state, &inputs[0]);
        server_state = server_apply(&server_state, &inputs[1]);
        server_state.position.x += 0.5;

        let miss = client
            .reconcile(&server_state)
            .expect("divergence beyond epsilon must be reported");

        assert_eq!(miss.replayed, 2);
        assert_eq!(client.pending_len(), 2);

        // The corrected present is exactly the authoritative state with
        // inputs 3 and 4 replayed through the shared step.
        let mut expected = server_state;
        expected = server_apply(&expected, &inputs[2]);
        expected = server_apply(&expected, &inputs[3]);

        assert_eq!(miss.corrected.position, expected.position);
        assert_eq!(client.current().position, expected.position);
        assert_eq!(client.current().last_processed_input, 4);
    }

    #[test]
    fn missing_ring_entry_still_replays() {
        let mut client = predictor();

        for tick in 1..=3 {
            client.predict(tick, Vec2::new(1.0, 0.0), 0.0, InputFlags::new());
        }

        // A snapshot for a tick the client never predicted (e.g. spawn
        // correction): no replay base in the ring.
        let snapshot = StateSnapshot {
            tick: 900,
            last_processed_input: 1,
            flags: StateFlags::new().with_grounded(true),
            ..StateSnapshot::default()
        };

        let miss = client.reconcile(&snapshot).expect("must reconcile");
        assert!(miss.predicted.is_none());
        assert_eq!(miss.replayed, 2);
    }

    #[test]
    fn acked_inputs_are_pruned_even_on_agreement() {
        let mut client = predictor();
        let mut server_state = StateSnapshot::spawn(0);

        for tick in 1..=3 {
            let input = client.predict(tick, Vec2::new(0.0, 1.0), 0.0, InputFlags::new());
            server_state = server_apply(&server_state, &input);
        }

        // Server snapshot for input 2: tick 2's prediction agrees.
        let mut at_two = StateSnapshot::spawn(0);
        for tick in 1..=2u32 {
            let input = InputData {
                tick,
                sequence: tick,
                move_dir: Vec2::new(0.0, 1.0),
                rotation: 0.0,
                flags: InputFlags::new(),
            };
            at_two = server_apply(&at_two, &input);
        }

        assert!(client.reconcile(&at_two).is_none());
        assert_eq!(client.pending_len(), 1);
        assert_eq!(client.pending.front().unwrap().sequence, 3);
    }

    #[test]
    fn reset_clears_prediction_state() {
        let mut client = predictor();
        client.predict(1, Vec2::new(0.0, 1.0), 0.0, InputFlags::new());

        let spawn = StateSnapshot::spawn(50);
        client.reset_to(spawn);

        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.current().tick, 50);
    }
}
