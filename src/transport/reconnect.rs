//! Reconnection backoff.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

/// Exponential backoff for reconnect attempts.
///
/// Delays start at `base_delay_ms`, double per attempt and are capped at
/// `max_delay_ms`; there are at most `max_attempts` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)))
            .with_max_times(self.max_attempts as usize)
    }

    /// One delay per reconnect attempt, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        self.builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 7,
            ..ReconnectPolicy::default()
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000]);
    }

    #[test]
    fn test_attempts_bound_the_delays() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3);
        assert_eq!(policy.delays().count(), 3);

        let none = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0);
        assert_eq!(none.delays().count(), 0);
    }

    #[test]
    fn test_max_below_base_uses_base() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::from_millis(10), 2);
        assert!(policy.delays().all(|d| d == Duration::from_millis(500)));
    }

    #[test]
    fn test_partial_config() {
        let policy: ReconnectPolicy = toml::from_str("max_attempts = 2").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 100);
    }
}
