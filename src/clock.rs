//! Processing-time source for window completion.
//!
//! Windows are keyed by **event time** (the tick's own timestamp) but completed
//! by **processing time**: a window `[start, end)` is done once the clock reads
//! at least `end` (plus any grace period). The clock is injected so tests can
//! drive completion deterministically with [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current processing time.
pub trait Clock: Send + Sync {
  /// Returns the current processing time.
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Manually advanced clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  /// Creates a clock frozen at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Moves the clock to `time`. Moving backwards is ignored.
  pub fn set(&self, time: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    if time > *now {
      *now = time;
    }
  }

  /// Advances the clock by `by`.
  pub fn advance(&self, by: ChronoDuration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Shared clock reference.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_manual_clock_is_shared_and_monotonic() {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let other = clock.clone();

    other.advance(ChronoDuration::seconds(30));
    assert_eq!(clock.now(), start + ChronoDuration::seconds(30));

    clock.set(start);
    assert_eq!(other.now(), start + ChronoDuration::seconds(30));
  }

  #[test]
  fn test_system_clock_moves_forward() {
    let a = SystemClock.now();
    let b = SystemClock.now();
    assert!(b >= a);
  }
}
