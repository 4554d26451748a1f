//! Window boundaries and window assignment.
//!
//! A tick is assigned to one or more windows before it is merged anywhere:
//!
//! - [`TumblingWindowAssigner`]: fixed-size, non-overlapping, contiguous windows.
//!   Every timestamp lands in exactly one window.
//! - [`HoppingWindowAssigner`]: fixed-size windows advancing by a smaller step.
//!   A timestamp lands in every window whose `[start, end)` contains it, and each
//!   of those windows is aggregated independently.
//! - Count windows ([`WindowPolicy::Count`]) have no time boundary. They are not
//!   assigned by timestamp; the operator keeps one rolling [`CountWindow`] per key.
//!
//! Window starts are aligned to the Unix epoch, so two workers given the same
//! policy always agree on boundaries.
//!
//! # Example
//!
//! ```rust
//! use tickweave::window::{HoppingWindowAssigner, WindowAssigner};
//! use chrono::{TimeZone, Utc};
//! use std::time::Duration;
//!
//! let assigner = HoppingWindowAssigner::new(Duration::from_secs(60), Duration::from_secs(30)).unwrap();
//! let windows = assigner.assign_windows(Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 45).unwrap());
//! assert_eq!(windows.len(), 2);
//! ```

use crate::error::{EngineError, EngineResult};
use crate::partitioning::PartitionKey;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// A time-based window with start and end timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
  /// Start time of the window (inclusive).
  start: DateTime<Utc>,
  /// End time of the window (exclusive).
  end: DateTime<Utc>,
}

impl TimeWindow {
  /// Creates a new time window with the given start and end.
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
    Self { start, end }
  }

  /// Returns the start time of the window.
  pub fn start(&self) -> DateTime<Utc> {
    self.start
  }

  /// Returns the end time of the window.
  pub fn end(&self) -> DateTime<Utc> {
    self.end
  }

  /// Returns the duration of the window.
  pub fn duration(&self) -> ChronoDuration {
    self.end - self.start
  }

  /// Returns true if the given timestamp falls within this window.
  pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
    timestamp >= self.start && timestamp < self.end
  }

  /// Returns true if this window intersects with another.
  pub fn intersects(&self, other: &TimeWindow) -> bool {
    self.start < other.end && other.start < self.end
  }
}

impl PartialOrd for TimeWindow {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for TimeWindow {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .start
      .cmp(&other.start)
      .then_with(|| self.end.cmp(&other.end))
  }
}

impl fmt::Display for TimeWindow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}, {})",
      self.start.format("%H:%M:%S%.3f"),
      self.end.format("%H:%M:%S%.3f")
    )
  }
}

/// A count-based window. The id increments every time the previous window
/// for the same key completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CountWindow {
  /// Window identifier (incremented for each new window).
  id: u64,
}

impl CountWindow {
  /// Creates a new count window with the given ID.
  pub fn new(id: u64) -> Self {
    Self { id }
  }

  /// Returns the window ID.
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Returns the window that follows this one.
  pub fn next(&self) -> Self {
    Self { id: self.id + 1 }
  }
}

impl fmt::Display for CountWindow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CountWindow(id={})", self.id)
  }
}

/// Identifier of one window within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowId {
  /// Time-bounded window (tumbling or hopping).
  Time(TimeWindow),
  /// Rolling count window.
  Count(CountWindow),
}

impl WindowId {
  /// Returns the time window, if this is one.
  pub fn as_time(&self) -> Option<&TimeWindow> {
    match self {
      WindowId::Time(w) => Some(w),
      WindowId::Count(_) => None,
    }
  }
}

impl fmt::Display for WindowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WindowId::Time(w) => write!(f, "{}", w),
      WindowId::Count(w) => write!(f, "{}", w),
    }
  }
}

/// Identifies one aggregation bucket: a partition key plus a window.
///
/// Ordered by partition first, so all windows of one key are contiguous in an
/// ordered map and sorted by start time within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
  /// Series this window belongs to.
  pub partition: PartitionKey,
  /// Window within the series.
  pub window: WindowId,
}

impl WindowKey {
  /// Creates a key for a time window.
  pub fn time(partition: PartitionKey, window: TimeWindow) -> Self {
    Self {
      partition,
      window: WindowId::Time(window),
    }
  }

  /// Creates a key for a count window.
  pub fn count(partition: PartitionKey, window: CountWindow) -> Self {
    Self {
      partition,
      window: WindowId::Count(window),
    }
  }
}

impl fmt::Display for WindowKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.partition, self.window)
  }
}

/// Window policy, configured once per deployment.
///
/// Sizes are signed milliseconds so that non-positive values in a config file
/// can be reported as configuration errors instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowPolicy {
  /// Non-overlapping windows of `size_ms`.
  Tumbling {
    /// Window length in milliseconds.
    size_ms: i64,
  },
  /// Overlapping windows of `size_ms` starting every `step_ms`.
  Hopping {
    /// Window length in milliseconds.
    size_ms: i64,
    /// Distance between consecutive window starts in milliseconds.
    step_ms: i64,
  },
  /// One rolling window per key that completes every `size` ticks.
  Count {
    /// Ticks per window.
    size: i64,
  },
}

impl WindowPolicy {
  /// Tumbling policy from a [`Duration`].
  pub fn tumbling(size: Duration) -> Self {
    WindowPolicy::Tumbling {
      size_ms: duration_ms(size),
    }
  }

  /// Hopping policy from [`Duration`]s.
  pub fn hopping(size: Duration, step: Duration) -> Self {
    WindowPolicy::Hopping {
      size_ms: duration_ms(size),
      step_ms: duration_ms(step),
    }
  }

  /// Count policy.
  pub fn count(size: u64) -> Self {
    WindowPolicy::Count {
      size: i64::try_from(size).unwrap_or(i64::MAX),
    }
  }

  /// Checks sizes and steps.
  pub fn validate(&self) -> EngineResult<()> {
    match *self {
      WindowPolicy::Tumbling { size_ms } if size_ms <= 0 => Err(EngineError::config(format!(
        "tumbling window size must be positive, got {}ms",
        size_ms
      ))),
      WindowPolicy::Hopping { size_ms, .. } if size_ms <= 0 => Err(EngineError::config(format!(
        "hopping window size must be positive, got {}ms",
        size_ms
      ))),
      WindowPolicy::Hopping { step_ms, .. } if step_ms <= 0 => Err(EngineError::config(format!(
        "hopping window step must be positive, got {}ms",
        step_ms
      ))),
      WindowPolicy::Hopping { size_ms, step_ms } if step_ms >= size_ms => {
        Err(EngineError::config(format!(
          "hopping window step ({}ms) must be smaller than size ({}ms)",
          step_ms, size_ms
        )))
      }
      WindowPolicy::Count { size } if size <= 0 => Err(EngineError::config(format!(
        "count window size must be positive, got {}",
        size
      ))),
      _ => Ok(()),
    }
  }

  /// Default window-type label, used when events do not carry one.
  pub fn label(&self) -> String {
    match *self {
      WindowPolicy::Tumbling { size_ms } => format_ms(size_ms),
      WindowPolicy::Hopping { size_ms, step_ms } => {
        format!("{}/{}", format_ms(size_ms), format_ms(step_ms))
      }
      WindowPolicy::Count { size } => format!("{}-tick", size),
    }
  }

  /// Length of one window, for time policies.
  pub fn window_length(&self) -> Option<ChronoDuration> {
    match *self {
      WindowPolicy::Tumbling { size_ms } | WindowPolicy::Hopping { size_ms, .. } => {
        Some(ChronoDuration::milliseconds(size_ms))
      }
      WindowPolicy::Count { .. } => None,
    }
  }

  /// Builds the assignment strategy for this policy after validating it.
  pub fn assignment(&self) -> EngineResult<WindowAssignment> {
    self.validate()?;
    Ok(match *self {
      WindowPolicy::Tumbling { size_ms } => {
        WindowAssignment::Time(Arc::new(TumblingWindowAssigner { size_ms }))
      }
      WindowPolicy::Hopping { size_ms, step_ms } => {
        WindowAssignment::Time(Arc::new(HoppingWindowAssigner { size_ms, step_ms }))
      }
      WindowPolicy::Count { size } => WindowAssignment::Count { size: size as u64 },
    })
  }
}

impl fmt::Display for WindowPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WindowPolicy::Tumbling { .. } => write!(f, "tumbling({})", self.label()),
      WindowPolicy::Hopping { .. } => write!(f, "hopping({})", self.label()),
      WindowPolicy::Count { .. } => write!(f, "count({})", self.label()),
    }
  }
}

fn duration_ms(d: Duration) -> i64 {
  i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn format_ms(ms: i64) -> String {
  if ms % 1000 == 0 {
    format!("{}s", ms / 1000)
  } else {
    format!("{}ms", ms)
  }
}

/// How a validated policy maps events to windows.
#[derive(Clone)]
pub enum WindowAssignment {
  /// Assigned by event timestamp.
  Time(SharedWindowAssigner),
  /// One rolling window per key of `size` ticks.
  Count {
    /// Ticks per window.
    size: u64,
  },
}

impl Debug for WindowAssignment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WindowAssignment::Time(_) => write!(f, "WindowAssignment::Time"),
      WindowAssignment::Count { size } => write!(f, "WindowAssignment::Count({})", size),
    }
  }
}

/// Trait for window assigners that assign elements to time windows.
pub trait WindowAssigner: Send + Sync {
  /// Assign a timestamp to zero or more windows, ordered by start time.
  fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<TimeWindow>;
}

/// Shared window assigner reference.
pub type SharedWindowAssigner = Arc<dyn WindowAssigner>;

fn window_at(start_ms: i64, size_ms: i64) -> Option<TimeWindow> {
  let start = DateTime::from_timestamp_millis(start_ms)?;
  let end = DateTime::from_timestamp_millis(start_ms.checked_add(size_ms)?)?;
  Some(TimeWindow::new(start, end))
}

/// Tumbling window assigner that creates non-overlapping windows.
///
/// Each element is assigned to exactly one window.
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
  /// Size of each window in milliseconds.
  size_ms: i64,
}

impl TumblingWindowAssigner {
  /// Creates a new tumbling window assigner with the given size.
  pub fn new(size: Duration) -> EngineResult<Self> {
    let size_ms = duration_ms(size);
    WindowPolicy::Tumbling { size_ms }.validate()?;
    Ok(Self { size_ms })
  }

  /// Returns the window size.
  pub fn size(&self) -> Duration {
    Duration::from_millis(self.size_ms as u64)
  }

  /// Calculates the window start for a given timestamp.
  fn window_start_ms(&self, timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis().div_euclid(self.size_ms) * self.size_ms
  }
}

impl WindowAssigner for TumblingWindowAssigner {
  fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<TimeWindow> {
    window_at(self.window_start_ms(timestamp), self.size_ms)
      .into_iter()
      .collect()
  }
}

/// Hopping window assigner that creates overlapping windows.
///
/// Each element is assigned to every window containing it: `size / step`
/// windows when the step divides the size, otherwise between
/// `floor(size / step)` and `ceil(size / step)`.
#[derive(Debug, Clone)]
pub struct HoppingWindowAssigner {
  /// Size of each window in milliseconds.
  size_ms: i64,
  /// Step between window starts in milliseconds.
  step_ms: i64,
}

impl HoppingWindowAssigner {
  /// Creates a new hopping window assigner. Fails unless `0 < step < size`.
  pub fn new(size: Duration, step: Duration) -> EngineResult<Self> {
    let (size_ms, step_ms) = (duration_ms(size), duration_ms(step));
    WindowPolicy::Hopping { size_ms, step_ms }.validate()?;
    Ok(Self { size_ms, step_ms })
  }

  /// Returns the window size.
  pub fn size(&self) -> Duration {
    Duration::from_millis(self.size_ms as u64)
  }

  /// Returns the step.
  pub fn step(&self) -> Duration {
    Duration::from_millis(self.step_ms as u64)
  }
}

impl WindowAssigner for HoppingWindowAssigner {
  fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<TimeWindow> {
    let ts_millis = timestamp.timestamp_millis();
    // Last window that could contain this timestamp
    let last_start = ts_millis.div_euclid(self.step_ms) * self.step_ms;

    let mut windows = Vec::new();
    let mut start = last_start;
    while start + self.size_ms > ts_millis {
      if let Some(window) = window_at(start, self.size_ms) {
        windows.push(window);
      }
      start -= self.step_ms;
    }
    windows.reverse();
    windows
  }
}
