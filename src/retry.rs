//! Exponential backoff with jitter for re-establishing watches.
//!
//! The watch loops never give up; they keep the last good state and retry with
//! growing delays until cancelled.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for a retrying loop
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }
}

/// Stateful backoff; call [`Backoff::reset`] after a success.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay with 0.5x to 1.5x jitter, never above the configured maximum
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        let grown = self.delay.as_secs_f64() * self.config.multiplier;
        self.delay = Duration::from_secs_f64(grown).min(self.config.max_delay);

        jittered.min(self.config.max_delay)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_bounded() {
        let mut backoff = Backoff::new(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
        ));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));

        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(800));
        }
        assert_eq!(backoff.attempt(), 11);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
        ));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }
}
