//! Prometheus-compatible metrics for the aggregation engine.
//!
//! Counters are recorded through the [`metrics`] facade. Nothing is exported
//! unless the embedding process installs a recorder; without one every call
//! here is a no-op.
//!
//! - `tickweave_events_in_total{worker}`: events accepted by a worker.
//! - `tickweave_malformed_events_total`: events dropped at decode/validation.
//! - `tickweave_late_events_total{reason}`: window contributions dropped as late.
//! - `tickweave_capacity_drops_total{worker}`: contributions dropped at the store bound.
//! - `tickweave_windows_emitted_total{window_type}`: windows handed to the sink.
//! - `tickweave_duplicate_emissions_total`: suppressed second completions.
//! - `tickweave_sink_retries_total` / `tickweave_sink_failures_total`.
//! - `tickweave_active_windows{worker}` gauge.

use metrics::{counter, gauge};

/// Records events accepted by a worker.
pub fn record_events_in(worker: usize, count: u64) {
  counter!("tickweave_events_in_total", "worker" => worker.to_string()).increment(count);
}

/// Records an event dropped because it could not be decoded or validated.
pub fn record_malformed_event() {
  counter!("tickweave_malformed_events_total").increment(1);
}

/// Records a window contribution dropped as late.
///
/// `reason` is `"emitted"` when the window was already emitted and
/// `"elapsed"` when its grace period had passed.
pub fn record_late_event(reason: &'static str) {
  counter!("tickweave_late_events_total", "reason" => reason).increment(1);
}

/// Records a contribution dropped because the store was full.
pub fn record_capacity_drop(worker: usize) {
  counter!("tickweave_capacity_drops_total", "worker" => worker.to_string()).increment(1);
}

/// Records a window handed to the sink.
pub fn record_window_emitted(window_type: &str) {
  counter!(
    "tickweave_windows_emitted_total",
    "window_type" => window_type.to_string()
  )
  .increment(1);
}

/// Records a suppressed duplicate completion.
pub fn record_duplicate_emission() {
  counter!("tickweave_duplicate_emissions_total").increment(1);
}

/// Records a retried sink publish.
pub fn record_sink_retry() {
  counter!("tickweave_sink_retries_total").increment(1);
}

/// Records a publish that failed after all retries.
pub fn record_sink_failure() {
  counter!("tickweave_sink_failures_total").increment(1);
}

/// Sets the number of open windows held by a worker.
pub fn record_active_windows(worker: usize, count: usize) {
  gauge!("tickweave_active_windows", "worker" => worker.to_string()).set(count as f64);
}
