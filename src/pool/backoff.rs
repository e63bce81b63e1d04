use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff settings, shared by registration replay and endpoint
/// discovery while degraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
  #[serde(default = "default_initial_ms")]
  pub initial_ms: u64,
  #[serde(default = "default_max_ms")]
  pub max_ms: u64,
  #[serde(default = "default_multiplier")]
  pub multiplier: f64,
  /// Attempts before giving up when no deadline bounds the retries
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Spread each delay by up to this fraction
  #[serde(default)]
  pub jitter: f64,
}

fn default_initial_ms() -> u64 {
  100
}

fn default_max_ms() -> u64 {
  30_000
}

fn default_multiplier() -> f64 {
  2.0
}

fn default_max_retries() -> u32 {
  5
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      initial_ms: default_initial_ms(),
      max_ms: default_max_ms(),
      multiplier: default_multiplier(),
      max_retries: default_max_retries(),
      jitter: 0.0,
    }
  }
}

/// Running backoff for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
  policy: BackoffPolicy,
  attempt: u32,
}

impl Backoff {
  pub fn new(policy: BackoffPolicy) -> Self {
    Self { policy, attempt: 0 }
  }

  pub fn exhausted(&self) -> bool {
    self.attempt >= self.policy.max_retries
  }

  /// Delay before the next attempt. Each call advances the schedule.
  pub fn next_delay(&mut self) -> Duration {
    let exp = self.policy.multiplier.max(1.0).powi(self.attempt.min(32) as i32);
    let base = (self.policy.initial_ms as f64 * exp).min(self.policy.max_ms as f64);
    self.attempt = self.attempt.saturating_add(1);
    let jitter = self.policy.jitter.clamp(0.0, 1.0);
    let ms = if jitter > 0.0 {
      let spread = base * jitter;
      base - spread + rand::thread_rng().gen_range(0.0..=2.0 * spread)
    } else {
      base
    };
    Duration::from_millis(ms.max(0.0) as u64)
  }

  pub fn reset(&mut self) {
    self.attempt = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exponential_growth_is_capped() {
    let mut backoff = Backoff::new(BackoffPolicy {
      initial_ms: 100,
      max_ms: 500,
      multiplier: 2.0,
      max_retries: 10,
      jitter: 0.0,
    });
    let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
    assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
  }

  #[test]
  fn test_jitter_stays_in_range() {
    let mut backoff = Backoff::new(BackoffPolicy {
      jitter: 0.5,
      ..Default::default()
    });
    let delay = backoff.next_delay().as_millis();
    assert!((50..=150).contains(&delay));
  }

  #[test]
  fn test_exhaustion() {
    let mut backoff = Backoff::new(BackoffPolicy {
      max_retries: 2,
      ..Default::default()
    });
    assert!(!backoff.exhausted());
    backoff.next_delay();
    backoff.next_delay();
    assert!(backoff.exhausted());
  }
}
