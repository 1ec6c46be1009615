//! Jittered, capped exponential backoff for reconnect loops.
//!
//! The exact schedule is implementation-defined; this one doubles from a
//! configurable floor up to a configurable cap and adds up to 20% jitter,
//! roughly `1s -> 5s -> ... -> 60s`, while staying tunable for tests.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            attempt: 0,
        }
    }

    /// Resets the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Computes the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.floor.as_millis().saturating_mul(1u128 << self.attempt.min(16));
        let capped = exp.min(self.cap.as_millis());
        self.attempt = self.attempt.saturating_add(1);

        let jitter_frac = rand::thread_rng().gen_range(0.0..0.2);
        let jittered = (capped as f64 * (1.0 + jitter_frac)) as u128;
        Duration::from_millis(jittered.min(u64::MAX as u128) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_saturate_at_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = b.next_delay();
        assert!(first.as_millis() >= 100);
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d.as_millis() <= 1_200); // cap + max jitter
        }
    }

    #[test]
    fn reset_restarts_from_the_floor() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(10));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        let d = b.next_delay();
        assert!(d.as_millis() < 100);
    }
}
