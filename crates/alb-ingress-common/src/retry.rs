//! Re-enqueue backoff for failing Ingress keys.
//!
//! The controller keeps one schedule per key, advancing it on each
//! failed pass and resetting it on success. Delays grow exponentially
//! with a cap and symmetric jitter so a fleet of failing keys does not
//! hammer the APIs in lockstep.

use std::time::Duration;

use rand::Rng;

/// Per-key re-enqueue schedule: exponential backoff with a cap and
/// symmetric jitter.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    cap: Duration,
    /// Fractional jitter; 0.1 means +/-10%
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a schedule with the given parameters
    pub fn new(initial: Duration, factor: f64, cap: Duration, jitter: f64) -> Self {
        Self {
            initial,
            factor,
            cap,
            jitter,
            attempt: 0,
        }
    }

    /// The controller's re-enqueue schedule: 1s initial, doubling, capped
    /// at 5 minutes, with +/-10% jitter.
    pub fn for_requeue() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(300), 0.1)
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Produce the next delay and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.initial.as_secs_f64() * self.factor.powi(self.attempt as i32);
        let capped = base.min(self.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(capped * (1.0 + spread))
    }

    /// Reset the schedule after a successful pass
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_schedule_doubles_and_caps() {
        // Zero jitter so delays are exact
        let mut b = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(300), 0.0);

        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));

        // Run the schedule well past the cap
        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(300));
    }

    #[test]
    fn requeue_jitter_stays_within_ten_percent() {
        let mut b = Backoff::for_requeue();
        // First delay is 1s +/- 10%
        for _ in 0..100 {
            b.reset();
            let d = b.next_delay().as_secs_f64();
            assert!((0.9..=1.1).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn requeue_reset_restarts_schedule() {
        let mut b = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(300), 0.0);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempts(), 2);

        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}
