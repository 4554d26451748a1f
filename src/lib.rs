//! # Tickweave
//!
//! Windowed moving-average aggregation over streams of price ticks.
//!
//! Ticks (or upstream partial aggregates) are assigned to time windows
//! (tumbling or hopping) or to rolling count windows, merged incrementally per
//! `(symbol, window type)` key, and emitted exactly once when the window
//! completes. Completion is driven both by arriving events and by a periodic
//! sweep, so windows close on time even when a symbol stops trading.
//!
//! ## Layers
//!
//! - [`window`]: window boundaries and assignment.
//! - [`aggregate`] and [`store`]: per-window running sums and their bounded store.
//! - [`lifecycle`]: the `Open -> Complete -> Emitted` state machine and tombstones.
//! - [`operator`]: the synchronous per-worker pipeline tying those together.
//! - [`engine`]: async workers, sharding by key, the sweep task and shutdown.
//! - [`sink`]: output records and publication with retry.
//!
//! ## Quick Start
//!
//! ```rust
//! use tickweave::operator::WindowOperator;
//! use tickweave::tick::RawTick;
//! use tickweave::window::WindowPolicy;
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let mut operator = WindowOperator::with_policy(WindowPolicy::tumbling(std::time::Duration::from_secs(5))).unwrap();
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
//! operator.process(&RawTick::new("2330", t0, 585.0, 10.0).into(), t0).unwrap();
//! let done = operator.sweep(t0 + Duration::seconds(5));
//! assert_eq!(done.len(), 1);
//! assert_eq!(done[0].record.sma_value, 585.0);
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Running per-window aggregates and the merge rules.
pub mod aggregate;
/// Processing-time source.
pub mod clock;
/// Engine configuration.
pub mod config;
/// Async workers, routing, sweep task and shutdown.
pub mod engine;
/// Error types.
pub mod error;
/// Window lifecycle state machine and completion triggers.
pub mod lifecycle;
/// Prometheus-compatible metrics for production observability.
pub mod metrics;
/// Single-owner window operator.
pub mod operator;
/// Partition keys and worker routing.
pub mod partitioning;
/// Output records, sinks and publish retries.
pub mod sink;
/// Bounded store of open window aggregates.
pub mod store;
/// Tracing subscriber setup.
pub mod telemetry;
/// Input events and their wire decoding.
pub mod tick;
/// Window boundaries and window assignment.
pub mod window;

#[cfg(test)]
mod properties_test;
