//! # Property Test Suite
//!
//! Property-based tests (proptest) for the arithmetic and assignment contract
//! and for at-most-once emission under arbitrary tick/sweep interleavings.

use crate::aggregate::{merge, AggregateRecord, Bounds};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lifecycle::CompletionPolicy;
use crate::operator::WindowOperator;
use crate::partitioning::PartitionKey;
use crate::tick::RawTick;
use crate::window::{
  HoppingWindowAssigner, TimeWindow, TumblingWindowAssigner, WindowAssigner, WindowKey, WindowPolicy,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

const SYMBOLS: [&str; 3] = ["2330", "2317", "2454"];

fn t0() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
enum Step {
  /// Tick for `SYMBOLS[symbol]` stamped `lag_ms` before the current time.
  Tick { symbol: usize, lag_ms: i64, vwap: f64 },
  /// Move processing time forward.
  Advance { ms: i64 },
  Sweep,
  /// Force completion of the window containing the current time.
  Complete { symbol: usize },
}

fn step() -> impl Strategy<Value = Step> {
  prop_oneof![
    4 => (0..SYMBOLS.len(), 0i64..8_000, 1.0f64..1_000.0)
      .prop_map(|(symbol, lag_ms, vwap)| Step::Tick { symbol, lag_ms, vwap }),
    2 => (0i64..3_000).prop_map(|ms| Step::Advance { ms }),
    1 => Just(Step::Sweep),
    1 => (0..SYMBOLS.len()).prop_map(|symbol| Step::Complete { symbol }),
  ]
}

fn contribution() -> impl Strategy<Value = (f64, f64, bool)> {
  (
    0.0f64..10_000.0,
    prop_oneof![Just(0.0f64), 0.001f64..1_000.0],
    any::<bool>(),
  )
}

proptest! {
  #[test]
  fn test_sma_is_mean_of_nonzero_size_contributions(
    contributions in prop::collection::vec(contribution(), 0..64)
  ) {
    let key = WindowKey::time(
      PartitionKey::new("2330", "5s"),
      TimeWindow::new(t0(), t0() + ChronoDuration::seconds(5)),
    );
    let mut record = AggregateRecord::empty(&key, t0());
    for (vwap, size, filled) in &contributions {
      let mut tick = RawTick::new("2330", t0(), *vwap, *size);
      tick.filled = *filled;
      record = merge(&record, &tick, Bounds::Fixed, t0());
    }

    let priced: Vec<f64> = contributions
      .iter()
      .filter(|(_, size, _)| *size != 0.0)
      .map(|(vwap, _, _)| *vwap)
      .collect();
    prop_assert_eq!(record.count_of_vwap, priced.len() as u64);
    prop_assert_eq!(record.window_data_count, contributions.len() as u64);
    prop_assert_eq!(record.real_data_count + record.filled_data_count, record.window_data_count);
    if priced.is_empty() {
      prop_assert_eq!(record.sma_value, 0.0);
    } else {
      let mean = priced.iter().sum::<f64>() / priced.len() as f64;
      prop_assert!((record.sma_value - mean).abs() <= 1e-9 * mean.abs().max(1.0));
    }
    prop_assert_eq!(record.start, t0());
    prop_assert_eq!(record.end, t0() + ChronoDuration::seconds(5));
  }

  #[test]
  fn test_tumbling_assigns_exactly_one_aligned_window(
    size_ms in 1i64..86_400_000,
    ts_ms in -1_000_000_000_000i64..4_000_000_000_000,
  ) {
    let assigner = TumblingWindowAssigner::new(Duration::from_millis(size_ms as u64)).unwrap();
    let ts = DateTime::from_timestamp_millis(ts_ms).unwrap();
    let windows = assigner.assign_windows(ts);
    prop_assert_eq!(windows.len(), 1);
    let window = windows[0];
    prop_assert!(window.contains(ts));
    prop_assert_eq!(window.duration(), ChronoDuration::milliseconds(size_ms));
    prop_assert_eq!(window.start().timestamp_millis().rem_euclid(size_ms), 0);
  }

  #[test]
  fn test_hopping_assigns_size_over_step_windows(
    step_ms in 1i64..600_000,
    ratio in 2i64..8,
    ts_ms in 0i64..4_000_000_000_000,
  ) {
    let size_ms = step_ms * ratio;
    let assigner = HoppingWindowAssigner::new(
      Duration::from_millis(size_ms as u64),
      Duration::from_millis(step_ms as u64),
    )
    .unwrap();
    let ts = DateTime::from_timestamp_millis(ts_ms).unwrap();
    let windows = assigner.assign_windows(ts);
    prop_assert_eq!(windows.len() as i64, ratio);
    for window in &windows {
      prop_assert!(window.contains(ts));
      prop_assert_eq!(window.start().timestamp_millis().rem_euclid(step_ms), 0);
    }
  }

  #[test]
  fn test_windows_emit_at_most_once(
    steps in prop::collection::vec(step(), 1..200),
    sweep_only in any::<bool>(),
  ) {
    let completion = if sweep_only {
      CompletionPolicy::SweepOnly
    } else {
      CompletionPolicy::WallClock
    };
    let config = EngineConfig::new(WindowPolicy::tumbling(Duration::from_secs(5)))
      .with_completion(completion)
      .with_grace_period(Duration::from_millis(1_500));
    let mut op = WindowOperator::new(&config).unwrap();
    let assigner = TumblingWindowAssigner::new(Duration::from_secs(5)).unwrap();

    let mut now = t0();
    let mut emitted: HashSet<WindowKey> = HashSet::new();
    let mut emitted_contributions = 0u64;
    let mut record = |done: Vec<crate::operator::CompletedWindow>| -> Result<(), TestCaseError> {
      for window in done {
        prop_assert!(emitted.insert(window.key.clone()), "emitted twice: {}", window.key);
        prop_assert!(window.record.emitted);
        emitted_contributions += window.record.window_data_count;
      }
      Ok(())
    };

    for step in steps {
      match step {
        Step::Tick { symbol, lag_ms, vwap } => {
          let ts = now - ChronoDuration::milliseconds(lag_ms);
          let done = op.process(&RawTick::new(SYMBOLS[symbol], ts, vwap, 1.0).into(), now).unwrap();
          record(done)?;
        }
        Step::Advance { ms } => now += ChronoDuration::milliseconds(ms),
        Step::Sweep => record(op.sweep(now))?,
        Step::Complete { symbol } => {
          let window = assigner.assign_windows(now)[0];
          let key = WindowKey::time(PartitionKey::new(SYMBOLS[symbol], "5s"), window);
          match op.complete(&key, now) {
            Ok(Some(done)) => record(vec![done])?,
            Ok(None) => {}
            Err(EngineError::DuplicateEmission(_)) => {}
            Err(other) => prop_assert!(false, "unexpected error {}", other),
          }
        }
      }
    }
    record(op.drain(now))?;
    drop(record);

    // Every accepted contribution is either emitted or counted as dropped.
    let stats = op.stats();
    prop_assert_eq!(op.active_windows(), 0);
    prop_assert_eq!(stats.windows_emitted as usize, emitted.len());
    prop_assert_eq!(
      emitted_contributions + stats.late_dropped + stats.capacity_dropped,
      stats.events_in
    );
  }
}
