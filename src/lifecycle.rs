//! Window lifecycle: when a window is complete, and what happens after.
//!
//! Every window moves through `Open -> Complete -> Emitted`. Two triggers can
//! complete a window and both converge on the same transition:
//!
//! - **on element**: evaluated for every open window of a key whenever an event
//!   for that key is merged ([`LifecycleController::on_element`]).
//! - **on processing time**: evaluated by the periodic sweep for every open
//!   window regardless of traffic ([`LifecycleController::on_processing_time`]).
//!
//! Time is the final authority for time windows: whatever the configured
//! [`CompletionPolicy`], the sweep completes a window once processing time has
//! passed `end + grace`.
//!
//! Emitted windows leave a tombstone behind so that a second completion (or a
//! late tick that would reopen the window) is detected instead of producing a
//! second record for the same key. Tombstones expire one window length after
//! the grace period ends, after which the time check alone rejects late ticks.

use crate::aggregate::AggregateRecord;
use crate::store::AggregateStore;
use crate::window::{WindowId, WindowKey};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// State of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
  /// Accepting merges.
  Open,
  /// Completion condition met; emission pending.
  Complete,
  /// Handed to the sink. Terminal.
  Emitted,
}

/// Result of trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
  /// Continue accumulating.
  Continue,
  /// Emit the window and remove its state.
  FireAndPurge,
}

/// Which event-driven condition completes a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionPolicy {
  /// Complete once processing time reaches `end + grace`, checked on every
  /// event for the key and by the sweep.
  #[default]
  WallClock,
  /// Complete once `window_data_count >= count`. The sweep still completes
  /// elapsed windows that never reach the threshold.
  CountThreshold {
    /// Contributions needed to complete a window.
    count: u64,
  },
  /// Events never complete windows; only the periodic sweep does.
  SweepOnly,
}

impl fmt::Display for CompletionPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CompletionPolicy::WallClock => write!(f, "wall_clock"),
      CompletionPolicy::CountThreshold { count } => write!(f, "count_threshold({})", count),
      CompletionPolicy::SweepOnly => write!(f, "sweep_only"),
    }
  }
}

/// Decides completion and tracks emitted windows.
#[derive(Debug, Clone)]
pub struct LifecycleController {
  completion: CompletionPolicy,
  /// Ticks per count window, when the window policy is count-based.
  count_size: Option<u64>,
  grace: ChronoDuration,
  /// Emitted windows and the time their tombstone may be dropped.
  emitted: HashMap<WindowKey, DateTime<Utc>>,
}

impl LifecycleController {
  /// Creates a controller. `count_size` is set for count-window policies and
  /// overrides `completion` for count windows.
  pub fn new(completion: CompletionPolicy, count_size: Option<u64>, grace: ChronoDuration) -> Self {
    Self {
      completion,
      count_size,
      grace,
      emitted: HashMap::new(),
    }
  }

  /// Configured completion policy.
  pub fn completion(&self) -> CompletionPolicy {
    self.completion
  }

  /// Returns true once processing time has passed a time window's
  /// `end + grace`. Count windows never elapse.
  pub fn is_elapsed(&self, key: &WindowKey, now: DateTime<Utc>) -> bool {
    match &key.window {
      WindowId::Time(w) => now >= saturating_add(w.end(), self.grace),
      WindowId::Count(_) => false,
    }
  }

  /// Returns true if `key` has already been emitted.
  pub fn is_emitted(&self, key: &WindowKey) -> bool {
    self.emitted.contains_key(key)
  }

  /// Returns true if a contribution for `key` must be dropped: the window was
  /// already emitted or its grace period is over.
  pub fn is_late(&self, key: &WindowKey, now: DateTime<Utc>) -> bool {
    self.is_emitted(key) || self.is_elapsed(key, now)
  }

  /// Evaluates a window after an event for its key was merged.
  pub fn on_element(&self, key: &WindowKey, record: &AggregateRecord, now: DateTime<Utc>) -> TriggerResult {
    let fire = match (&key.window, self.completion) {
      (WindowId::Count(_), _) => self
        .count_size
        .is_some_and(|size| record.window_data_count >= size),
      (WindowId::Time(_), CompletionPolicy::WallClock) => self.is_elapsed(key, now),
      (WindowId::Time(_), CompletionPolicy::CountThreshold { count }) => {
        record.window_data_count >= count
      }
      (WindowId::Time(_), CompletionPolicy::SweepOnly) => false,
    };
    if fire {
      TriggerResult::FireAndPurge
    } else {
      TriggerResult::Continue
    }
  }

  /// Evaluates a window from the periodic sweep.
  pub fn on_processing_time(&self, key: &WindowKey, now: DateTime<Utc>) -> TriggerResult {
    if self.is_elapsed(key, now) {
      TriggerResult::FireAndPurge
    } else {
      TriggerResult::Continue
    }
  }

  /// Current state of `key` given the store contents.
  pub fn state(&self, key: &WindowKey, store: &AggregateStore, now: DateTime<Utc>) -> Option<WindowState> {
    if self.is_emitted(key) {
      return Some(WindowState::Emitted);
    }
    let record = store.get(key)?;
    let complete = self.on_element(key, &record, now) == TriggerResult::FireAndPurge
      || self.on_processing_time(key, now) == TriggerResult::FireAndPurge;
    Some(if complete {
      WindowState::Complete
    } else {
      WindowState::Open
    })
  }

  /// Records the `Complete -> Emitted` transition. Returns false if the key
  /// was already emitted, in which case nothing changes.
  pub fn mark_emitted(&mut self, key: &WindowKey, record: &AggregateRecord, now: DateTime<Utc>) -> bool {
    if self.is_emitted(key) {
      return false;
    }
    let expires_at = match &key.window {
      WindowId::Time(w) => saturating_add(saturating_add(w.end(), self.grace), w.duration()),
      // Count window ids never repeat for a key; the tombstone only has to
      // outlive the current operation.
      WindowId::Count(_) => now.max(record.last_update_time),
    };
    self.emitted.insert(key.clone(), expires_at);
    true
  }

  /// Drops tombstones that can no longer matter. Returns how many were dropped.
  pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
    let before = self.emitted.len();
    self.emitted.retain(|_, expires_at| *expires_at > now);
    before - self.emitted.len()
  }

  /// Drops every count-window tombstone. Count window ids may be reused
  /// afterwards.
  pub fn forget_count_windows(&mut self) -> usize {
    let before = self.emitted.len();
    self.emitted.retain(|key, _| matches!(key.window, WindowId::Time(_)));
    before - self.emitted.len()
  }

  /// Number of tombstones currently held.
  pub fn tombstones(&self) -> usize {
    self.emitted.len()
  }
}

/// `at + delta`, clamped to the last representable instant.
fn saturating_add(at: DateTime<Utc>, delta: ChronoDuration) -> DateTime<Utc> {
  at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
