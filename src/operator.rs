//! Single-owner window operator.
//!
//! [`WindowOperator`] runs the whole per-event pipeline for the keys owned by
//! one worker:
//!
//! ```text
//! event -> assign windows -> get_or_create -> merge -> evaluate -> retire
//! ```
//!
//! It is synchronous and takes `&mut self`, so all bookkeeping for a key is
//! serialized by whoever owns the operator. The async worker in
//! [`engine`](crate::engine) is one such owner; tests drive it directly.
//!
//! Completed windows are removed from the store, tombstoned, and returned to
//! the caller as [`CompletedWindow`]s for publication. A window is returned at
//! most once.

use crate::aggregate::{combine, merge, AggregateRecord, Bounds};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{LifecycleController, TriggerResult, WindowState};
use crate::metrics;
use crate::partitioning::PartitionKey;
use crate::store::AggregateStore;
use crate::tick::Event;
use crate::window::{CountWindow, WindowAssignment, WindowId, WindowKey, WindowPolicy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::AddAssign;
use tracing::{debug, info, warn};

/// A window that has been completed and retired from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedWindow {
  /// Key of the window.
  pub key: WindowKey,
  /// Final state, with `emitted` set.
  pub record: AggregateRecord,
}

/// Counters kept by an operator (and summed across workers on shutdown).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStats {
  /// Events accepted for processing.
  pub events_in: u64,
  /// Events rejected as malformed.
  pub malformed: u64,
  /// Window contributions dropped because the window was emitted or elapsed.
  pub late_dropped: u64,
  /// Window contributions dropped because the store was full.
  pub capacity_dropped: u64,
  /// Windows completed and handed out for emission.
  pub windows_emitted: u64,
  /// Second completions that were suppressed.
  pub duplicates_suppressed: u64,
  /// Open windows thrown away by an immediate stop.
  pub discarded: u64,
  /// Emissions the sink never accepted.
  pub publish_failures: u64,
}

impl AddAssign for OperatorStats {
  fn add_assign(&mut self, other: Self) {
    self.events_in += other.events_in;
    self.malformed += other.malformed;
    self.late_dropped += other.late_dropped;
    self.capacity_dropped += other.capacity_dropped;
    self.windows_emitted += other.windows_emitted;
    self.duplicates_suppressed += other.duplicates_suppressed;
    self.discarded += other.discarded;
    self.publish_failures += other.publish_failures;
  }
}

/// Window bookkeeping for the keys owned by one worker.
#[derive(Debug)]
pub struct WindowOperator {
  worker: usize,
  label: String,
  assignment: WindowAssignment,
  store: AggregateStore,
  lifecycle: LifecycleController,
  /// Current count window per key.
  count_windows: HashMap<PartitionKey, CountWindow>,
  stats: OperatorStats,
}

impl WindowOperator {
  /// Creates an operator from a validated configuration.
  pub fn new(config: &EngineConfig) -> EngineResult<Self> {
    Self::for_worker(config, 0)
  }

  /// Creates the operator for worker `worker`.
  pub fn for_worker(config: &EngineConfig, worker: usize) -> EngineResult<Self> {
    config.validate()?;
    let assignment = config.window.assignment()?;
    let count_size = match assignment {
      WindowAssignment::Count { size } => Some(size),
      WindowAssignment::Time(_) => None,
    };
    let operator = Self {
      worker,
      label: config.window.label(),
      assignment,
      store: AggregateStore::new(config.max_active_windows),
      lifecycle: LifecycleController::new(config.completion, count_size, config.grace_period()),
      count_windows: HashMap::new(),
      stats: OperatorStats::default(),
    };
    debug!(
      worker,
      window_type = %operator.label,
      completion = %operator.lifecycle.completion(),
      capacity = operator.store.capacity(),
      "operator ready"
    );
    Ok(operator)
  }

  /// Convenience constructor for a policy with default settings.
  pub fn with_policy(policy: WindowPolicy) -> EngineResult<Self> {
    Self::new(&EngineConfig::new(policy))
  }

  /// Folds `event` into every window it belongs to and returns the windows
  /// that completed as a result.
  ///
  /// Malformed events are rejected with [`EngineError::MalformedEvent`] and
  /// leave no trace besides the counter. Late or over-capacity contributions
  /// are dropped per window and counted; they do not fail the call.
  pub fn process(&mut self, event: &Event, now: DateTime<Utc>) -> EngineResult<Vec<CompletedWindow>> {
    if let Err(err) = validate_event(event) {
      self.stats.malformed += 1;
      metrics::record_malformed_event();
      warn!(worker = self.worker, error = %err, "dropping malformed event");
      return Err(err);
    }
    self.stats.events_in += 1;
    metrics::record_events_in(self.worker, 1);

    let partition = event.partition_key(&self.label);
    let mut completed = Vec::new();

    for key in self.targets(&partition, event) {
      if self.lifecycle.is_late(&key, now) {
        let reason = if self.lifecycle.is_emitted(&key) {
          "emitted"
        } else {
          "elapsed"
        };
        self.stats.late_dropped += 1;
        metrics::record_late_event(reason);
        warn!(
          symbol = %partition.symbol,
          window_type = %partition.window_type,
          window = %key.window,
          event_time = %event.timestamp(),
          contributions = event.contribution_count(),
          reason,
          "dropping late contribution"
        );
        continue;
      }

      let record = match self.store.get_or_create(&key, now) {
        Ok(record) => record,
        Err(EngineError::CapacityExceeded { .. }) => {
          // Make room by retiring whatever has already elapsed, then retry once.
          completed.extend(self.sweep(now));
          match self.store.get_or_create(&key, now) {
            Ok(record) => record,
            Err(err) => {
              self.stats.capacity_dropped += 1;
              metrics::record_capacity_drop(self.worker);
              warn!(worker = self.worker, window = %key, error = %err, "dropping contribution");
              continue;
            }
          }
        }
        Err(err) => return Err(err),
      };

      let bounds = match key.window.as_time() {
        Some(_) => Bounds::Fixed,
        None => Bounds::Rolling,
      };
      let next = match event {
        Event::Tick(tick) => merge(&record, tick, bounds, now),
        Event::Partial(partial) => combine(&record, partial, bounds, now),
      };
      debug!(
        window = %key,
        window_data_count = next.window_data_count,
        sma_value = next.sma_value,
        "merged"
      );
      self.store.put(key, next);
    }

    // Evaluate every open window of the key, not just the ones touched: a tick
    // for a later window is the usual signal that earlier ones are done.
    for key in self.store.keys_for(&partition) {
      let fire = match self.store.get(&key) {
        Some(record) => self.lifecycle.on_element(&key, &record, now) == TriggerResult::FireAndPurge,
        None => false,
      };
      if fire {
        if let Ok(Some(window)) = self.retire(&key, now) {
          completed.push(window);
        }
      }
    }

    metrics::record_active_windows(self.worker, self.store.len());
    Ok(completed)
  }

  /// Completes every open window whose time has elapsed and prunes expired
  /// tombstones. Runs independently of event arrival.
  pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<CompletedWindow> {
    let lifecycle = &self.lifecycle;
    let due: Vec<WindowKey> = self
      .store
      .scan(|key, _| lifecycle.on_processing_time(key, now) == TriggerResult::FireAndPurge)
      .map(|(key, _)| key.clone())
      .collect();

    let completed: Vec<CompletedWindow> = due
      .iter()
      .filter_map(|key| self.retire(key, now).ok().flatten())
      .collect();

    let pruned = self.lifecycle.prune(now);
    if !completed.is_empty() || pruned > 0 {
      debug!(
        worker = self.worker,
        completed = completed.len(),
        pruned_tombstones = pruned,
        open = self.store.len(),
        "sweep"
      );
    }
    metrics::record_active_windows(self.worker, self.store.len());
    completed
  }

  /// Forces completion of `key`.
  ///
  /// Returns `Ok(None)` if no such window is open, and
  /// [`EngineError::DuplicateEmission`] if it was already emitted.
  pub fn complete(&mut self, key: &WindowKey, now: DateTime<Utc>) -> EngineResult<Option<CompletedWindow>> {
    self.retire(key, now)
  }

  /// Completes every open window regardless of time (graceful drain).
  pub fn drain(&mut self, now: DateTime<Utc>) -> Vec<CompletedWindow> {
    let keys: Vec<WindowKey> = self.store.scan(|_, _| true).map(|(key, _)| key.clone()).collect();
    let completed: Vec<CompletedWindow> = keys
      .iter()
      .filter_map(|key| self.retire(key, now).ok().flatten())
      .collect();
    self.reset_count_windows();
    info!(worker = self.worker, flushed = completed.len(), "drained open windows");
    metrics::record_active_windows(self.worker, 0);
    completed
  }

  /// Throws away every open window without emitting it (immediate stop).
  pub fn discard(&mut self) -> usize {
    let dropped = self.store.take_all().len();
    self.reset_count_windows();
    self.stats.discarded += dropped as u64;
    if dropped > 0 {
      warn!(worker = self.worker, dropped, "discarded open windows");
    }
    metrics::record_active_windows(self.worker, 0);
    dropped
  }

  /// Current state of `key`.
  pub fn window_state(&self, key: &WindowKey, now: DateTime<Utc>) -> Option<WindowState> {
    self.lifecycle.state(key, &self.store, now)
  }

  /// Copy of the open record for `key`.
  pub fn record(&self, key: &WindowKey) -> Option<AggregateRecord> {
    self.store.get(key)
  }

  /// Keys of the open windows of `partition`.
  pub fn open_windows(&self, partition: &PartitionKey) -> Vec<WindowKey> {
    self.store.keys_for(partition)
  }

  /// Number of open windows.
  pub fn active_windows(&self) -> usize {
    self.store.len()
  }

  /// Number of emitted-window tombstones held.
  pub fn tombstones(&self) -> usize {
    self.lifecycle.tombstones()
  }

  /// Default window-type label.
  pub fn label(&self) -> &str {
    &self.label
  }

  /// Counters so far.
  pub fn stats(&self) -> OperatorStats {
    self.stats
  }

  /// Counts a publish that failed after all retries.
  pub fn record_publish_failure(&mut self) {
    self.stats.publish_failures += 1;
  }

  /// Forgets per-key count window ids once no count window is open, so the
  /// map does not grow with every symbol ever seen.
  fn reset_count_windows(&mut self) {
    self.count_windows.clear();
    self.lifecycle.forget_count_windows();
  }

  /// Windows `event` contributes to.
  fn targets(&mut self, partition: &PartitionKey, event: &Event) -> Vec<WindowKey> {
    match &self.assignment {
      WindowAssignment::Time(assigner) => assigner
        .assign_windows(event.timestamp())
        .into_iter()
        .map(|window| WindowKey::time(partition.clone(), window))
        .collect(),
      WindowAssignment::Count { .. } => {
        let window = *self
          .count_windows
          .entry(partition.clone())
          .or_insert_with(|| CountWindow::new(0));
        vec![WindowKey::count(partition.clone(), window)]
      }
    }
  }

  /// `Complete -> Emitted`: removes the record, tombstones the key and hands
  /// the final state back.
  fn retire(&mut self, key: &WindowKey, now: DateTime<Utc>) -> EngineResult<Option<CompletedWindow>> {
    if self.lifecycle.is_emitted(key) {
      self.stats.duplicates_suppressed += 1;
      metrics::record_duplicate_emission();
      // Anything still stored under an emitted key is stale.
      self.store.remove(key);
      warn!(window = %key, "suppressed duplicate emission");
      return Err(EngineError::DuplicateEmission(key.to_string()));
    }
    let Some(mut record) = self.store.remove(key) else {
      return Ok(None);
    };
    self.lifecycle.mark_emitted(key, &record, now);
    record.emitted = true;

    if let WindowId::Count(window) = key.window {
      self.count_windows.insert(key.partition.clone(), window.next());
    }

    self.stats.windows_emitted += 1;
    metrics::record_window_emitted(&key.partition.window_type);
    info!(
      symbol = %key.partition.symbol,
      window_type = %key.partition.window_type,
      start = %record.start,
      end = %record.end,
      window_data_count = record.window_data_count,
      sma_value = record.sma_value,
      "window complete"
    );
    Ok(Some(CompletedWindow {
      key: key.clone(),
      record,
    }))
  }
}

fn validate_event(event: &Event) -> EngineResult<()> {
  if event.symbol().trim().is_empty() {
    return Err(EngineError::malformed("missing symbol"));
  }
  match event {
    Event::Tick(tick) if !tick.vwap.is_finite() || !tick.size.is_finite() => Err(EngineError::malformed(
      format!("tick for {}: vwap and size must be finite", tick.symbol),
    )),
    Event::Tick(_) => Ok(()),
    Event::Partial(partial) => partial.validate(),
  }
}
