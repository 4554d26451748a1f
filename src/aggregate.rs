//! Per-window accumulation state and the incremental merge rules.
//!
//! [`merge`] and [`combine`] are pure: they take the current record by
//! reference and return the next state. The store owns the record in between.
//!
//! Arithmetic contract:
//!
//! - `sum_of_vwap` / `count_of_vwap` only accumulate contributions with a
//!   non-zero traded size.
//! - `window_data_count` counts every contribution, including zero-size and
//!   gap-filled ticks, and always equals `real_data_count + filled_data_count`.
//! - `sma_value` is recomputed on every merge; an empty accumulator yields `0.0`.

use crate::tick::{PartialAggregate, RawTick};
use crate::window::{WindowId, WindowKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accumulation state for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
  /// Instrument type of the series (first non-empty value seen).
  pub instrument_type: String,
  /// Sum of VWAP over non-zero-size contributions.
  pub sum_of_vwap: f64,
  /// Number of non-zero-size contributions.
  pub count_of_vwap: u64,
  /// `sum_of_vwap / count_of_vwap`, or `0.0` when empty.
  pub sma_value: f64,
  /// Total contributions merged.
  pub window_data_count: u64,
  /// Genuinely observed contributions.
  pub real_data_count: u64,
  /// Gap-filled contributions.
  pub filled_data_count: u64,
  /// Window start.
  pub start: DateTime<Utc>,
  /// Window end. For count windows, the latest merged timestamp.
  pub end: DateTime<Utc>,
  /// Processing time of the last merge.
  pub last_update_time: DateTime<Utc>,
  /// Set once the record has been handed to the sink.
  pub emitted: bool,
}

impl AggregateRecord {
  /// Zero-valued record for `key`.
  ///
  /// Time windows take their boundaries from the key. Count windows have no
  /// boundary yet, so both ends start at `created_at` and follow the ticks.
  pub fn empty(key: &WindowKey, created_at: DateTime<Utc>) -> Self {
    let (start, end) = match &key.window {
      WindowId::Time(w) => (w.start(), w.end()),
      WindowId::Count(_) => (created_at, created_at),
    };
    Self {
      instrument_type: String::new(),
      sum_of_vwap: 0.0,
      count_of_vwap: 0,
      sma_value: 0.0,
      window_data_count: 0,
      real_data_count: 0,
      filled_data_count: 0,
      start,
      end,
      last_update_time: created_at,
      emitted: false,
    }
  }

  /// Returns true if nothing has been merged yet.
  pub fn is_empty(&self) -> bool {
    self.window_data_count == 0
  }

  fn recompute_sma(&mut self) {
    self.sma_value = if self.count_of_vwap > 0 {
      self.sum_of_vwap / self.count_of_vwap as f64
    } else {
      0.0
    };
  }

  fn adopt_instrument_type(&mut self, instrument_type: &str) {
    if self.instrument_type.is_empty() && !instrument_type.is_empty() {
      self.instrument_type = instrument_type.to_string();
    }
  }

  /// Moves a count window's boundaries to cover `timestamp`.
  fn track_count_bounds(&mut self, timestamp: DateTime<Utc>) {
    if self.is_empty() {
      self.start = timestamp;
    }
    self.end = timestamp;
  }
}

/// How a merge treats window boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bounds {
  /// Boundaries were fixed when the record was created.
  Fixed,
  /// Rolling count window: `end` follows the latest timestamp.
  Rolling,
}

/// Folds one tick into `record`.
pub fn merge(record: &AggregateRecord, tick: &RawTick, bounds: Bounds, now: DateTime<Utc>) -> AggregateRecord {
  let mut next = record.clone();
  if bounds == Bounds::Rolling {
    next.track_count_bounds(tick.timestamp);
  }
  if tick.size != 0.0 {
    next.sum_of_vwap += tick.vwap;
    next.count_of_vwap += 1;
  }
  next.window_data_count += 1;
  if tick.filled {
    next.filled_data_count += 1;
  } else {
    next.real_data_count += 1;
  }
  next.adopt_instrument_type(&tick.instrument_type);
  next.recompute_sma();
  next.last_update_time = now;
  next
}

/// Folds a pre-aggregated partial into `record`.
///
/// Sums and counts add; the partial's own boundaries are ignored in favor of
/// the record's. The partial is expected to satisfy
/// [`PartialAggregate::validate`].
pub fn combine(
  record: &AggregateRecord,
  partial: &PartialAggregate,
  bounds: Bounds,
  now: DateTime<Utc>,
) -> AggregateRecord {
  let mut next = record.clone();
  if bounds == Bounds::Rolling {
    next.track_count_bounds(partial.timestamp);
  }
  next.sum_of_vwap += partial.sum_of_vwap;
  next.count_of_vwap += partial.count_of_vwap;
  next.window_data_count += partial.window_data_count;
  next.real_data_count += partial.real_data_count;
  next.filled_data_count += partial.filled_data_count;
  next.adopt_instrument_type(&partial.instrument_type);
  next.recompute_sma();
  next.last_update_time = now;
  next
}
