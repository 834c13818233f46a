//! Reconnect wait suggestions.
//!
//! The connection manager never sleeps or retries on its own. After a failed
//! connect or session establishment it asks a [`BackoffPolicy`] how long the
//! caller should wait and reports that figure to its handler; scheduling the
//! next attempt belongs to whoever owns the retry loop.

use std::time::Duration;

use rand::Rng;

/// Source of suggested waits between reconnect attempts.
pub trait BackoffPolicy: Send {
    /// Suggested wait before the next attempt. Advances the policy.
    fn next_wait(&mut self) -> Duration;

    /// Called after a successful connection.
    fn reset(&mut self);
}

/// Configuration for [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Wait after the first failure (default: 100ms).
    pub initial_wait: Duration,
    /// Upper bound on any suggested wait (default: 30s).
    pub max_wait: Duration,
    /// Growth factor per failure (default: 2.0).
    pub multiplier: f64,
    /// Fraction of the wait that may be shaved off at random (default: 0.1).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a policy with the given configuration.
    pub fn new(config: BackoffConfig) -> Self {
        if config.initial_wait > config.max_wait {
            tracing::warn!(
                initial_ms = config.initial_wait.as_millis() as u64,
                max_ms = config.max_wait.as_millis() as u64,
                "initial backoff exceeds max backoff"
            );
        }
        Self { config, attempt: 0 }
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_wait(&self) -> Duration {
        let initial = self.config.initial_wait.as_millis() as f64;
        let computed = initial * self.config.multiplier.powi(self.attempt as i32);
        let capped = computed.min(self.config.max_wait.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_wait(&mut self) -> Duration {
        let base = self.base_wait();
        let jitter_range = (base.as_millis() as f64 * self.config.jitter_fraction) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        self.attempt = self.attempt.saturating_add(1);
        let wait = Duration::from_millis((base.as_millis() as u64).saturating_sub(jitter).max(1));
        tracing::debug!(
            attempt = self.attempt,
            wait_ms = wait.as_millis() as u64,
            "next reconnect wait"
        );
        wait
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_wait, Duration::from_millis(100));
        assert_eq!(config.max_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_waits_grow_exponentially() {
        let mut policy = ExponentialBackoff::new(no_jitter());
        assert_eq!(policy.next_wait(), Duration::from_millis(100));
        assert_eq!(policy.next_wait(), Duration::from_millis(200));
        assert_eq!(policy.next_wait(), Duration::from_millis(400));
        assert_eq!(policy.attempt(), 3);
    }

    #[test]
    fn test_waits_capped() {
        let mut policy = ExponentialBackoff::new(BackoffConfig {
            max_wait: Duration::from_millis(250),
            ..no_jitter()
        });
        for _ in 0..10 {
            assert!(policy.next_wait() <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut policy = ExponentialBackoff::new(no_jitter());
        policy.next_wait();
        policy.next_wait();
        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_wait(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut policy = ExponentialBackoff::default();
        for _ in 0..50 {
            policy.reset();
            let wait = policy.next_wait();
            assert!(wait >= Duration::from_millis(90));
            assert!(wait <= Duration::from_millis(100));
        }
    }
}
