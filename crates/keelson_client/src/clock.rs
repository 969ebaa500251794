//! Server-clock estimation from ping round trips.

/// Tracks the offset between the local clock and the server's tick
/// counter.
///
/// Fed by `Pong` messages: the echoed client timestamp yields a round
/// trip, half of which is the one-way latency the input tick estimate
/// must lead by. Time values are caller-supplied milliseconds so the
/// estimator itself stays deterministic and testable.
#[derive(Clone, Debug)]
pub struct ServerClock {
    tick_rate: u32,
    /// Smoothed one-way latency in milliseconds.
    latency_ms: f64,
    /// Server tick observed at `synced_at_ms`, latency-adjusted.
    base_tick: u32,
    synced_at_ms: u64,
    synced: bool,
}

impl ServerClock {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick_rate,
            latency_ms: 0.0,
            base_tick: 0,
            synced_at_ms: 0,
            synced: false,
        }
    }

    /// Feeds one pong. `now_ms` is the local clock at receipt,
    /// `echoed_ms` the timestamp the matching ping carried, and
    /// `server_tick` the server's tick when it answered.
    pub fn on_pong(&mut self, now_ms: u64, echoed_ms: u64, server_tick: u32) {
        let rtt = now_ms.saturating_sub(echoed_ms) as f64;
        let one_way = rtt / 2.0;

        // First sample is taken as-is; later samples are smoothed so a
        // single delayed pong does not yank the clock.
        if self.synced {
            self.latency_ms = self.latency_ms * 0.9 + one_way * 0.1;
        } else {
            self.latency_ms = one_way;
            self.synced = true;
        }

        let lead_ticks = (self.latency_ms * f64::from(self.tick_rate) / 1000.0).round() as u32;
        self.base_tick = server_tick.wrapping_add(lead_ticks);
        self.synced_at_ms = now_ms;
    }

    /// The estimated current server tick at local time `now_ms`.
    pub fn estimated_tick(&self, now_ms: u64) -> u32 {
        let elapsed_ms = now_ms.saturating_sub(self.synced_at_ms);
        let elapsed_ticks =
            (elapsed_ms as f64 * f64::from(self.tick_rate) / 1000.0).round() as u32;
        self.base_tick.wrapping_add(elapsed_ticks)
    }

    /// One-way latency in milliseconds, as currently smoothed.
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    /// Whether at least one pong has been observed.
    pub fn is_synced(&self) -> bool {
        self.synced
    }
}
