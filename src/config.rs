//! Engine configuration.
//!
//! [`EngineConfig`] can be built in code with the `with_*` methods or loaded
//! from JSON:
//!
//! ```rust
//! use tickweave::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!   "window": { "kind": "hopping", "size_ms": 60000, "step_ms": 30000 },
//!   "parallelism": 2,
//!   "sweep_interval_ms": 1000
//! }"#).unwrap();
//! assert_eq!(config.parallelism, 2);
//! ```
//!
//! Omitted fields take their defaults. [`EngineConfig::validate`] is called by
//! every constructor that starts work, so an invalid config never gets as far
//! as a running worker.

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::CompletionPolicy;
use crate::window::WindowPolicy;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behavior for sink publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  /// Delay before the second attempt.
  pub initial_backoff_ms: u64,
  /// Upper bound on any single delay.
  pub max_backoff_ms: u64,
  /// Factor applied to the delay after each failed attempt.
  pub multiplier: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff_ms: 100,
      max_backoff_ms: 5_000,
      multiplier: 2.0,
    }
  }
}

impl RetryPolicy {
  /// Policy that tries exactly once.
  pub fn no_retry() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Sets the number of attempts.
  pub fn with_max_attempts(mut self, n: u32) -> Self {
    self.max_attempts = n;
    self
  }

  /// Sets the initial backoff.
  pub fn with_initial_backoff(mut self, d: Duration) -> Self {
    self.initial_backoff_ms = d.as_millis() as u64;
    self
  }

  /// Delay to wait after failed attempt number `attempt` (1-based).
  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
    let millis = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
    Duration::from_millis(millis.max(0.0) as u64)
  }

  fn validate(&self) -> EngineResult<()> {
    if self.max_attempts == 0 {
      return Err(EngineError::config("retry.max_attempts must be at least 1"));
    }
    if !self.multiplier.is_finite() || self.multiplier < 1.0 {
      return Err(EngineError::config(format!(
        "retry.multiplier must be >= 1.0, got {}",
        self.multiplier
      )));
    }
    Ok(())
  }
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Window policy.
  pub window: WindowPolicy,
  /// Completion trigger for time windows.
  pub completion: CompletionPolicy,
  /// Number of workers; each key is owned by exactly one.
  pub parallelism: usize,
  /// Period of the completion sweep.
  pub sweep_interval_ms: u64,
  /// Allowed lateness after a window's end.
  pub grace_period_ms: u64,
  /// Bound on open windows per worker.
  pub max_active_windows: usize,
  /// Capacity of each worker's command queue.
  pub channel_capacity: usize,
  /// Sink retry behavior.
  pub retry: RetryPolicy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      window: WindowPolicy::Hopping {
        size_ms: 60_000,
        step_ms: 30_000,
      },
      completion: CompletionPolicy::WallClock,
      parallelism: 2,
      sweep_interval_ms: 1_000,
      grace_period_ms: 0,
      max_active_windows: 100_000,
      channel_capacity: 1_024,
      retry: RetryPolicy::default(),
    }
  }
}

impl EngineConfig {
  /// Creates a configuration with the given window policy and defaults.
  pub fn new(window: WindowPolicy) -> Self {
    Self {
      window,
      ..Self::default()
    }
  }

  /// Parses and validates a JSON configuration.
  pub fn from_json_str(json: &str) -> EngineResult<Self> {
    let config: EngineConfig =
      serde_json::from_str(json).map_err(|e| EngineError::config(format!("invalid config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Sets the completion policy.
  pub fn with_completion(mut self, completion: CompletionPolicy) -> Self {
    self.completion = completion;
    self
  }

  /// Sets the number of workers.
  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism;
    self
  }

  /// Sets the sweep interval.
  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval_ms = interval.as_millis() as u64;
    self
  }

  /// Sets the grace period.
  pub fn with_grace_period(mut self, grace: Duration) -> Self {
    self.grace_period_ms = grace.as_millis() as u64;
    self
  }

  /// Sets the bound on open windows per worker.
  pub fn with_max_active_windows(mut self, n: usize) -> Self {
    self.max_active_windows = n;
    self
  }

  /// Sets the command queue capacity.
  pub fn with_channel_capacity(mut self, n: usize) -> Self {
    self.channel_capacity = n;
    self
  }

  /// Sets the sink retry policy.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Sweep interval as a [`Duration`].
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms)
  }

  /// Grace period as a chrono duration.
  pub fn grace_period(&self) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(self.grace_period_ms).unwrap_or(i64::MAX))
  }

  /// Checks every option. Any error here is fatal at startup.
  pub fn validate(&self) -> EngineResult<()> {
    self.window.validate()?;
    if let CompletionPolicy::CountThreshold { count: 0 } = self.completion {
      return Err(EngineError::config("completion count threshold must be at least 1"));
    }
    if self.parallelism == 0 {
      return Err(EngineError::config("parallelism must be at least 1"));
    }
    if self.sweep_interval_ms == 0 {
      return Err(EngineError::config("sweep_interval_ms must be positive"));
    }
    if i64::try_from(self.grace_period_ms).is_err() {
      return Err(EngineError::config("grace_period_ms is out of range"));
    }
    if self.max_active_windows == 0 {
      return Err(EngineError::config("max_active_windows must be at least 1"));
    }
    if self.channel_capacity == 0 {
      return Err(EngineError::config("channel_capacity must be at least 1"));
    }
    self.retry.validate()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    EngineConfig::default().validate().unwrap();
  }

  #[test]
  fn test_from_json_with_defaults() {
    let config = EngineConfig::from_json_str(
      r#"{"window": {"kind": "count", "size": 10}, "completion": {"kind": "sweep_only"}}"#,
    )
    .unwrap();
    assert_eq!(config.window, WindowPolicy::Count { size: 10 });
    assert_eq!(config.completion, CompletionPolicy::SweepOnly);
    assert_eq!(config.parallelism, 2);
    assert_eq!(config.retry.max_attempts, 3);
  }

  #[test]
  fn test_invalid_windows_are_configuration_errors() {
    let cases = [
      r#"{"window": {"kind": "tumbling", "size_ms": 0}}"#,
      r#"{"window": {"kind": "tumbling", "size_ms": -5}}"#,
      r#"{"window": {"kind": "hopping", "size_ms": 60000, "step_ms": 60000}}"#,
      r#"{"window": {"kind": "hopping", "size_ms": 60000, "step_ms": 0}}"#,
      r#"{"window": {"kind": "count", "size": 0}}"#,
      r#"{"parallelism": 0}"#,
      r#"{"sweep_interval_ms": 0}"#,
      r#"{"completion": {"kind": "count_threshold", "count": 0}}"#,
      r#"{"retry": {"max_attempts": 0}}"#,
      r#"{"window": {"kind": "sliding"}}"#,
    ];
    for case in cases {
      let err = EngineConfig::from_json_str(case).unwrap_err();
      assert!(matches!(err, EngineError::Configuration(_)), "{} -> {:?}", case, err);
    }
  }

  #[test]
  fn test_backoff_grows_and_caps() {
    let retry = RetryPolicy {
      max_attempts: 10,
      initial_backoff_ms: 100,
      max_backoff_ms: 1_000,
      multiplier: 2.0,
    };
    assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
    assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
    assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
    assert_eq!(retry.backoff_for(8), Duration::from_millis(1_000));
  }
}
