//! Exponential reconnect backoff with full jitter.
//!
//! `delay = random(0, min(cap, base * 2^attempt))`, capped at 60 seconds.

use std::time::Duration;

use dgfacade_config::ResolvedChannel;

/// Hard cap on reconnect delays.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Reconnect delay calculator.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a calculator with an explicit base and cap.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Derive the base delay from the channel's
    /// `reconnect_interval_seconds` property (default 5), capped at 60 s.
    #[must_use]
    pub fn for_channel(channel: &ResolvedChannel) -> Self {
        let base = channel.property_u64("reconnect_interval_seconds", 5);
        Self::new(Duration::from_secs(base), MAX_RECONNECT_DELAY)
    }

    /// Compute the next delay and advance the attempt counter.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let exp = base_ms.saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let capped = exp.min(cap_ms);
        let jittered = if capped == 0 {
            0
        } else {
            fastrand::u64(0..=capped)
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered)
    }

    /// Reset the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_bounded_by_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), MAX_RECONNECT_DELAY);
        for _ in 0..50 {
            backoff.reset();
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
    }

    #[test]
    fn delays_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(8));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(8));
        }
    }

    #[test]
    fn attempt_counter_saturates() {
        let mut backoff = Backoff::new(Duration::from_secs(1), MAX_RECONNECT_DELAY);
        for _ in 0..100 {
            let _ = backoff.next_delay();
        }
        assert!(backoff.next_delay() <= MAX_RECONNECT_DELAY);
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut backoff = Backoff::new(Duration::from_millis(100), MAX_RECONNECT_DELAY);
        for _ in 0..10 {
            let _ = backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }
}
