//! Async runtime: sharded workers, a periodic sweep, and sink publication.
//!
//! [`WindowEngine::start`] spawns `parallelism` workers. Each worker owns a
//! [`WindowOperator`] and a command queue; events are routed to a worker by a
//! stable hash of their partition key, so every key is owned by exactly one
//! worker and all of its bookkeeping is serialized there. A separate sweep task
//! asks every worker to complete elapsed windows on a fixed interval, whether
//! or not new events arrive.
//!
//! Dropping the [`EngineHandle`] without calling [`EngineHandle::shutdown`]
//! stops the sweep task and lets every worker exit once its queue is empty;
//! windows still open at that point are discarded.
//!
//! ```rust,no_run
//! use tickweave::clock::SystemClock;
//! use tickweave::config::EngineConfig;
//! use tickweave::engine::{ShutdownMode, WindowEngine};
//! use tickweave::sink::MemorySink;
//! use tickweave::tick::RawTick;
//! use tickweave::window::WindowPolicy;
//! use chrono::Utc;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> tickweave::error::EngineResult<()> {
//! let sink = MemorySink::new();
//! let config = EngineConfig::new(WindowPolicy::tumbling(Duration::from_secs(5)));
//! let handle = WindowEngine::start(config, Arc::new(sink.clone()), Arc::new(SystemClock))?;
//! handle.submit(RawTick::new("2330", Utc::now(), 585.0, 12.0).into()).await?;
//! let report = handle.shutdown(ShutdownMode::Drain).await?;
//! assert_eq!(report.stats.windows_emitted as usize, sink.len());
//! # Ok(())
//! # }
//! ```

use crate::clock::SharedClock;
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::operator::{CompletedWindow, OperatorStats, WindowOperator};
use crate::partitioning::shard_for_key;
use crate::sink::{publish_with_retry, EmittedAggregate, SharedSink};
use crate::tick::{decode_event, Event};
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How open windows are treated on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Complete and publish every open window.
  Drain,
  /// Discard open windows without publishing them.
  Immediate,
}

/// Summary returned by [`EngineHandle::shutdown`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
  /// Counters summed across workers, plus input that failed to decode.
  pub stats: OperatorStats,
  /// Per-worker counters, indexed by worker id.
  pub workers: Vec<OperatorStats>,
  /// Mode the engine was stopped with.
  pub mode: ShutdownMode,
}

enum Command {
  Event(Event),
  Sweep(Option<oneshot::Sender<usize>>),
  Shutdown(ShutdownMode, oneshot::Sender<OperatorStats>),
}

/// Entry point for starting the engine.
pub struct WindowEngine;

impl WindowEngine {
  /// Validates `config` and spawns the workers and the sweep task.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(config: EngineConfig, sink: SharedSink, clock: SharedClock) -> EngineResult<EngineHandle> {
    config.validate()?;

    let mut senders = Vec::with_capacity(config.parallelism);
    let mut workers = Vec::with_capacity(config.parallelism);
    for worker_id in 0..config.parallelism {
      let operator = WindowOperator::for_worker(&config, worker_id)?;
      let (tx, rx) = mpsc::channel(config.channel_capacity);
      senders.push(tx);
      let worker = Worker {
        id: worker_id,
        operator,
        sink: sink.clone(),
        clock: clock.clone(),
        retry: config.retry.clone(),
      };
      workers.push(tokio::spawn(worker.run(rx)));
    }

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_task(
      senders.iter().map(mpsc::Sender::downgrade).collect(),
      config.sweep_interval(),
      cancel.clone(),
    ));

    info!(
      window = %config.window,
      completion = %config.completion,
      workers = config.parallelism,
      sweep_interval_ms = config.sweep_interval_ms,
      grace_period_ms = config.grace_period_ms,
      "window engine started"
    );

    Ok(EngineHandle {
      label: config.window.label(),
      senders,
      workers,
      sweeper: Some(sweeper),
      cancel,
      decode_failures: Arc::new(AtomicU64::new(0)),
    })
  }
}

/// Handle to a running engine.
///
/// The handle holds the only senders to the worker queues; dropping it shuts
/// the engine down without draining.
pub struct EngineHandle {
  label: String,
  senders: Vec<mpsc::Sender<Command>>,
  workers: Vec<JoinHandle<()>>,
  sweeper: Option<JoinHandle<()>>,
  cancel: CancellationToken,
  decode_failures: Arc<AtomicU64>,
}

impl EngineHandle {
  /// Number of workers.
  pub fn worker_count(&self) -> usize {
    self.senders.len()
  }

  /// Routes `event` to the worker that owns its key.
  ///
  /// Waits if that worker's queue is full.
  pub async fn submit(&self, event: Event) -> EngineResult<()> {
    let key = event.partition_key(&self.label);
    let worker = shard_for_key(&key, self.senders.len());
    self.senders[worker]
      .send(Command::Event(event))
      .await
      .map_err(|_| EngineError::Shutdown(format!("worker {} has stopped", worker)))
  }

  /// Decodes a JSON message and submits it.
  ///
  /// Undecodable input is counted and returned as
  /// [`EngineError::MalformedEvent`]; the engine keeps running.
  pub async fn submit_bytes(&self, bytes: &[u8]) -> EngineResult<()> {
    match decode_event(bytes) {
      Ok(event) => self.submit(event).await,
      Err(err) => {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_malformed_event();
        warn!(error = %err, "dropping undecodable message");
        Err(err)
      }
    }
  }

  /// Submits every event of `events`. Returns how many were submitted.
  pub async fn ingest<S>(&self, events: S) -> EngineResult<u64>
  where
    S: Stream<Item = Event>,
  {
    let mut events = std::pin::pin!(events);
    let mut submitted = 0;
    while let Some(event) = events.next().await {
      self.submit(event).await?;
      submitted += 1;
    }
    debug!(submitted, "stream ingested");
    Ok(submitted)
  }

  /// Runs a sweep on every worker now and waits for it. Returns the number of
  /// windows completed.
  ///
  /// Events submitted before this call are processed before the sweep.
  pub async fn sweep_now(&self) -> EngineResult<usize> {
    let mut acks = Vec::with_capacity(self.senders.len());
    for (worker, tx) in self.senders.iter().enumerate() {
      let (ack_tx, ack_rx) = oneshot::channel();
      tx.send(Command::Sweep(Some(ack_tx)))
        .await
        .map_err(|_| EngineError::Shutdown(format!("worker {} has stopped", worker)))?;
      acks.push(ack_rx);
    }
    let mut completed = 0;
    for ack in acks {
      completed += ack
        .await
        .map_err(|_| EngineError::Shutdown("worker stopped during sweep".to_string()))?;
    }
    Ok(completed)
  }

  /// Stops the sweep task, drains or discards open windows, and joins every
  /// worker.
  pub async fn shutdown(mut self, mode: ShutdownMode) -> EngineResult<EngineReport> {
    self.cancel.cancel();
    if let Some(sweeper) = self.sweeper.take() {
      if let Err(err) = sweeper.await {
        warn!(error = %err, "sweep task ended abnormally");
      }
    }

    let senders = std::mem::take(&mut self.senders);
    let mut acks = Vec::with_capacity(senders.len());
    for (worker, tx) in senders.iter().enumerate() {
      let (ack_tx, ack_rx) = oneshot::channel();
      tx.send(Command::Shutdown(mode, ack_tx))
        .await
        .map_err(|_| EngineError::Shutdown(format!("worker {} has stopped", worker)))?;
      acks.push(ack_rx);
    }

    let mut workers = Vec::with_capacity(acks.len());
    for ack in acks {
      let stats = ack
        .await
        .map_err(|_| EngineError::Shutdown("worker stopped before reporting".to_string()))?;
      workers.push(stats);
    }
    drop(senders);
    for handle in std::mem::take(&mut self.workers) {
      handle
        .await
        .map_err(|e| EngineError::Shutdown(format!("worker task failed: {}", e)))?;
    }

    let mut stats = OperatorStats {
      malformed: self.decode_failures.load(Ordering::Relaxed),
      ..OperatorStats::default()
    };
    for worker in &workers {
      stats += *worker;
    }
    info!(
      ?mode,
      events_in = stats.events_in,
      windows_emitted = stats.windows_emitted,
      late_dropped = stats.late_dropped,
      discarded = stats.discarded,
      "window engine stopped"
    );
    Ok(EngineReport { stats, workers, mode })
  }
}

impl Drop for EngineHandle {
  fn drop(&mut self) {
    if !self.senders.is_empty() {
      warn!(workers = self.senders.len(), "engine handle dropped without shutdown");
    }
    self.cancel.cancel();
  }
}

struct Worker {
  id: usize,
  operator: WindowOperator,
  sink: SharedSink,
  clock: SharedClock,
  retry: RetryPolicy,
}

impl Worker {
  async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
    debug!(worker = self.id, "worker started");
    while let Some(command) = rx.recv().await {
      match command {
        Command::Event(event) => {
          let now = self.clock.now();
          // Malformed events are logged and counted by the operator.
          if let Ok(completed) = self.operator.process(&event, now) {
            self.publish(completed).await;
          }
        }
        Command::Sweep(ack) => {
          let completed = self.operator.sweep(self.clock.now());
          let count = completed.len();
          self.publish(completed).await;
          if let Some(ack) = ack {
            let _ = ack.send(count);
          }
        }
        Command::Shutdown(mode, ack) => {
          match mode {
            ShutdownMode::Drain => {
              let completed = self.operator.drain(self.clock.now());
              self.publish(completed).await;
            }
            ShutdownMode::Immediate => {
              self.operator.discard();
            }
          }
          let _ = ack.send(self.operator.stats());
          debug!(worker = self.id, "worker stopped");
          return;
        }
      }
    }
    // The handle went away without a shutdown command.
    self.operator.discard();
    debug!(worker = self.id, "worker stopped");
  }

  async fn publish(&mut self, completed: Vec<CompletedWindow>) {
    for window in completed {
      let record = EmittedAggregate::new(&window.key, &window.record, self.clock.now());
      let outcome = publish_with_retry(self.sink.as_ref(), &record, &self.retry).await;
      if !outcome.is_delivered() {
        self.operator.record_publish_failure();
      }
    }
  }
}

async fn sweep_task(senders: Vec<mpsc::WeakSender<Command>>, period: Duration, cancel: CancellationToken) {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately.
  ticker.tick().await;
  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = ticker.tick() => {
        for (worker, weak) in senders.iter().enumerate() {
          let Some(tx) = weak.upgrade() else {
            debug!(worker, "engine handle gone, stopping sweep task");
            return;
          };
          let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(Command::Sweep(None)) => sent,
          };
          if sent.is_err() {
            error!(worker, "worker queue closed, stopping sweep task");
            return;
          }
        }
      }
    }
  }
}
