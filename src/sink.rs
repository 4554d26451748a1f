//! Emission sinks and publish retries.
//!
//! A completed window is converted into an [`EmittedAggregate`] and handed to
//! an [`EmissionSink`]. Rejected publishes are retried with capped exponential
//! backoff ([`RetryPolicy`]). When every attempt fails the emission is reported
//! as failed, but the window stays emitted: a lost record is preferred over a
//! duplicate one.

use crate::aggregate::AggregateRecord;
use crate::config::RetryPolicy;
use crate::error::SinkError;
use crate::metrics;
use crate::window::WindowKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

/// Output record for one completed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedAggregate {
  /// Instrument symbol.
  pub symbol: String,
  /// Instrument type.
  #[serde(rename = "type")]
  pub instrument_type: String,
  /// Window-type label.
  #[serde(rename = "MA_type")]
  pub window_type: String,
  /// Window start.
  pub start: DateTime<Utc>,
  /// Window end.
  pub end: DateTime<Utc>,
  /// Emission time.
  pub current_time: DateTime<Utc>,
  /// Mean VWAP over non-zero-size contributions.
  pub sma_value: f64,
  /// Sum of VWAP over non-zero-size contributions.
  pub sum_of_vwap: f64,
  /// Number of non-zero-size contributions.
  pub count_of_vwap: u64,
  /// Total contributions.
  pub window_data_count: u64,
  /// Real contributions.
  pub real_data_count: u64,
  /// Gap-filled contributions.
  pub filled_data_count: u64,
}

impl EmittedAggregate {
  /// Builds the output record for `key` emitted at `emitted_at`.
  pub fn new(key: &WindowKey, record: &AggregateRecord, emitted_at: DateTime<Utc>) -> Self {
    Self {
      symbol: key.partition.symbol.clone(),
      instrument_type: record.instrument_type.clone(),
      window_type: key.partition.window_type.clone(),
      start: record.start,
      end: record.end,
      current_time: emitted_at,
      sma_value: record.sma_value,
      sum_of_vwap: record.sum_of_vwap,
      count_of_vwap: record.count_of_vwap,
      window_data_count: record.window_data_count,
      real_data_count: record.real_data_count,
      filled_data_count: record.filled_data_count,
    }
  }

  /// Routing key for downstream publication.
  pub fn key(&self) -> String {
    format!("{}_{}", self.symbol, self.window_type)
  }
}

/// Destination for completed windows.
#[async_trait]
pub trait EmissionSink: Send + Sync {
  /// Publishes one record.
  async fn publish(&self, record: &EmittedAggregate) -> Result<(), SinkError>;
}

/// Shared sink reference.
pub type SharedSink = Arc<dyn EmissionSink>;

/// Sink that forwards records into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  tx: mpsc::Sender<EmittedAggregate>,
}

impl ChannelSink {
  /// Creates a sink and the receiving half of its channel.
  pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EmittedAggregate>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Self { tx }, rx)
  }

  /// Creates a sink and exposes the receiving half as a stream.
  pub fn with_stream(capacity: usize) -> (Self, ReceiverStream<EmittedAggregate>) {
    let (sink, rx) = Self::new(capacity);
    (sink, ReceiverStream::new(rx))
  }
}

#[async_trait]
impl EmissionSink for ChannelSink {
  async fn publish(&self, record: &EmittedAggregate) -> Result<(), SinkError> {
    self
      .tx
      .send(record.clone())
      .await
      .map_err(|_| SinkError::Closed("receiver dropped".to_string()))
  }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
  records: Arc<Mutex<Vec<EmittedAggregate>>>,
}

impl MemorySink {
  /// Creates an empty sink. Clones share the same buffer.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a copy of everything published so far.
  pub fn records(&self) -> Vec<EmittedAggregate> {
    self
      .records
      .lock()
      .map(|records| records.clone())
      .unwrap_or_default()
  }

  /// Number of records published so far.
  pub fn len(&self) -> usize {
    self.records.lock().map(|records| records.len()).unwrap_or(0)
  }

  /// Returns true if nothing was published.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl EmissionSink for MemorySink {
  async fn publish(&self, record: &EmittedAggregate) -> Result<(), SinkError> {
    self
      .records
      .lock()
      .map_err(|_| SinkError::Closed("memory sink lock poisoned".to_string()))?
      .push(record.clone());
    Ok(())
  }
}

/// Sink that logs each record as JSON at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EmissionSink for TracingSink {
  async fn publish(&self, record: &EmittedAggregate) -> Result<(), SinkError> {
    let json = serde_json::to_string(record).map_err(|e| SinkError::Encode(e.to_string()))?;
    info!(key = %record.key(), record = %json, "window aggregate");
    Ok(())
  }
}

/// Result of [`publish_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
  /// The sink accepted the record.
  Delivered {
    /// Attempts used, including the successful one.
    attempts: u32,
  },
  /// Every attempt was rejected.
  Failed {
    /// Attempts used.
    attempts: u32,
    /// Error from the final attempt.
    last_error: SinkError,
  },
}

impl PublishOutcome {
  /// Returns true if the record was delivered.
  pub fn is_delivered(&self) -> bool {
    matches!(self, PublishOutcome::Delivered { .. })
  }
}

/// Publishes `record`, retrying rejected attempts per `policy`.
///
/// [`SinkError::Closed`] and [`SinkError::Encode`] are not retried: neither
/// gets better by waiting.
pub async fn publish_with_retry(
  sink: &dyn EmissionSink,
  record: &EmittedAggregate,
  policy: &RetryPolicy,
) -> PublishOutcome {
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 0;
  loop {
    attempt += 1;
    match sink.publish(record).await {
      Ok(()) => return PublishOutcome::Delivered { attempts: attempt },
      Err(err) => {
        let retryable = matches!(err, SinkError::Rejected(_));
        if !retryable || attempt >= max_attempts {
          metrics::record_sink_failure();
          error!(
            key = %record.key(),
            start = %record.start,
            attempts = attempt,
            error = %err,
            "giving up on window emission"
          );
          return PublishOutcome::Failed {
            attempts: attempt,
            last_error: err,
          };
        }
        let delay = policy.backoff_for(attempt);
        metrics::record_sink_retry();
        warn!(
          key = %record.key(),
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "sink rejected window, retrying"
        );
        tokio::time::sleep(delay).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::partitioning::PartitionKey;
  use crate::window::TimeWindow;
  use chrono::{Duration, TimeZone};
  use futures::StreamExt;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration as StdDuration;

  fn sample() -> EmittedAggregate {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
    let key = WindowKey::time(
      PartitionKey::new("2330", "5-second"),
      TimeWindow::new(t0, t0 + Duration::seconds(5)),
    );
    let mut record = AggregateRecord::empty(&key, t0);
    record.instrument_type = "stock".to_string();
    record.sum_of_vwap = 30.0;
    record.count_of_vwap = 2;
    record.sma_value = 15.0;
    record.window_data_count = 3;
    record.real_data_count = 3;
    EmittedAggregate::new(&key, &record, t0 + Duration::seconds(5))
  }

  /// Rejects the first `failures` publishes.
  struct FlakySink {
    failures: u32,
    calls: AtomicU32,
    inner: MemorySink,
  }

  #[async_trait]
  impl EmissionSink for FlakySink {
    async fn publish(&self, record: &EmittedAggregate) -> Result<(), SinkError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.failures {
        return Err(SinkError::Rejected(format!("attempt {}", call + 1)));
      }
      self.inner.publish(record).await
    }
  }

  fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
      .with_max_attempts(max_attempts)
      .with_initial_backoff(StdDuration::from_millis(10))
  }

  #[test]
  fn test_emitted_aggregate_wire_names() {
    let json = serde_json::to_value(sample()).unwrap();
    assert_eq!(json["symbol"], "2330");
    assert_eq!(json["type"], "stock");
    assert_eq!(json["MA_type"], "5-second");
    assert_eq!(json["sma_value"], 15.0);
    assert_eq!(json["start"], "2024-01-02T09:00:00Z");
    assert_eq!(json["current_time"], "2024-01-02T09:00:05Z");
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_then_deliver() {
    let sink = FlakySink {
      failures: 2,
      calls: AtomicU32::new(0),
      inner: MemorySink::new(),
    };
    let outcome = publish_with_retry(&sink, &sample(), &fast_retry(3)).await;
    assert_eq!(outcome, PublishOutcome::Delivered { attempts: 3 });
    assert_eq!(sink.inner.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhausted() {
    let sink = FlakySink {
      failures: 10,
      calls: AtomicU32::new(0),
      inner: MemorySink::new(),
    };
    let outcome = publish_with_retry(&sink, &sample(), &fast_retry(3)).await;
    assert!(!outcome.is_delivered());
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert!(sink.inner.is_empty());
  }

  #[tokio::test]
  async fn test_closed_channel_is_not_retried() {
    let (sink, rx) = ChannelSink::new(1);
    drop(rx);
    let outcome = publish_with_retry(&sink, &sample(), &fast_retry(5)).await;
    assert!(matches!(
      outcome,
      PublishOutcome::Failed {
        attempts: 1,
        last_error: SinkError::Closed(_)
      }
    ));
  }

  #[tokio::test]
  async fn test_channel_sink_stream() {
    let (sink, mut stream) = ChannelSink::with_stream(4);
    sink.publish(&sample()).await.unwrap();
    drop(sink);
    assert_eq!(stream.next().await.unwrap().symbol, "2330");
    assert!(stream.next().await.is_none());
  }

  #[tokio::test]
  async fn test_tracing_sink_accepts_records() {
    crate::telemetry::init_test_tracing();
    assert!(TracingSink.publish(&sample()).await.is_ok());
  }
}
