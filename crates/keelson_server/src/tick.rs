//! Tick timing accounting.

use std::time::Duration;

/// Exponential smoothing factor for the rolling average.
const ALPHA: f64 = 0.1;

/// Duration bookkeeping for the fixed-tick scheduler.
#[derive(Clone, Debug, Default)]
pub struct TickStats {
    last: Duration,
    smoothed_secs: f64,
    ticks: u64,
    over_budget: u64,
}

impl TickStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed tick; returns whether it blew the budget.
    pub fn record(&mut self, duration: Duration, budget: Duration) -> bool {
        self.last = duration;
        self.ticks += 1;

        let secs = duration.as_secs_f64();
        if self.ticks == 1 {
            self.smoothed_secs = secs;
        } else {
            self.smoothed_secs = self.smoothed_secs * (1.0 - ALPHA) + secs * ALPHA;
        }

        let over = duration > budget;
        if over {
            self.over_budget += 1;
        }
        over
    }

    pub fn last_duration(&self) -> Duration {
        self.last
    }

    pub fn smoothed(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_secs)
    }

    pub fn over_budget_count(&self) -> u64 {
        self.over_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut stats = TickStats::new();
        stats.record(Duration::from_millis(10), Duration::from_millis(33));

        assert_eq!(stats.last_duration(), Duration::from_millis(10));
        assert_eq!(stats.smoothed(), Duration::from_millis(10));
    }

    #[test]
    fn average_moves_a_tenth_per_sample() {
        let mut stats = TickStats::new();
        let budget = Duration::from_millis(33);

        stats.record(Duration::from_millis(10), budget);
        stats.record(Duration::from_millis(20), budget);

        // 10 * 0.9 + 20 * 0.1 = 11.
        assert!((stats.smoothed().as_secs_f64() - 0.011).abs() < 1e-9);
    }

    #[test]
    fn over_budget_is_flagged_and_counted() {
        let mut stats = TickStats::new();
        let budget = Duration::from_millis(33);

        assert!(!stats.record(Duration::from_millis(33), budget));
        assert!(stats.record(Duration::from_millis(34), budget));
        assert_eq!(stats.over_budget_count(), 1);
    }
}
