//! Error types for the aggregation engine.
//!
//! Errors fall into three groups with different handling:
//!
//! - **Fatal at startup**: [`EngineError::Configuration`]. Returned by config
//!   validation and by every constructor that starts work; never recovered.
//! - **Per-event**: [`EngineError::MalformedEvent`] and
//!   [`EngineError::CapacityExceeded`]. The offending event (or window
//!   assignment) is dropped and counted; processing continues.
//! - **Logic/concurrency faults**: [`EngineError::DuplicateEmission`]. Detected
//!   and suppressed; surfaced as a warning, never published twice.
//!
//! Sink failures have their own type, [`SinkError`], since they are retried
//! before they ever reach the engine.

use thiserror::Error;

/// Error raised by an [`EmissionSink`](crate::sink::EmissionSink) when a
/// publish attempt is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
  /// The downstream side is gone (channel closed, client dropped).
  #[error("sink closed: {0}")]
  Closed(String),
  /// The record could not be encoded for publication.
  #[error("encode error: {0}")]
  Encode(String),
  /// The downstream rejected the record; may succeed on retry.
  #[error("publish rejected: {0}")]
  Rejected(String),
}

/// Error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
  /// Invalid window size/step, parallelism or other startup option.
  #[error("configuration error: {0}")]
  Configuration(String),
  /// Input event could not be decoded or is missing a required field.
  #[error("malformed event: {0}")]
  MalformedEvent(String),
  /// Completion was triggered for a window that has already been emitted.
  #[error("duplicate emission attempt for {0}")]
  DuplicateEmission(String),
  /// The store is at its active-window bound and nothing could be evicted.
  #[error("aggregate store full ({limit} active windows)")]
  CapacityExceeded {
    /// Configured bound.
    limit: usize,
  },
  /// Publishing to the sink failed after all retries.
  #[error("sink error: {0}")]
  Sink(#[from] SinkError),
  /// The engine is shutting down and no longer accepts work.
  #[error("engine shut down: {0}")]
  Shutdown(String),
}

impl EngineError {
  /// Shorthand for a configuration error.
  pub fn config(msg: impl Into<String>) -> Self {
    EngineError::Configuration(msg.into())
  }

  /// Shorthand for a malformed-event error.
  pub fn malformed(msg: impl Into<String>) -> Self {
    EngineError::MalformedEvent(msg.into())
  }

  /// Returns true when the error only affects the current event.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      EngineError::MalformedEvent(_)
        | EngineError::CapacityExceeded { .. }
        | EngineError::DuplicateEmission(_)
        | EngineError::Sink(_)
    )
  }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_display() {
    let err = EngineError::config("step must be smaller than size");
    assert!(err.to_string().contains("configuration error"));

    let err = EngineError::malformed("missing symbol");
    assert!(err.to_string().contains("missing symbol"));

    let err = EngineError::CapacityExceeded { limit: 8 };
    assert!(err.to_string().contains("8 active windows"));

    let err: EngineError = SinkError::Closed("receiver dropped".to_string()).into();
    assert!(err.to_string().contains("sink closed"));
  }

  #[test]
  fn test_recoverable_classification() {
    assert!(!EngineError::config("bad").is_recoverable());
    assert!(!EngineError::Shutdown("stopping".to_string()).is_recoverable());
    assert!(EngineError::malformed("bad").is_recoverable());
    assert!(EngineError::DuplicateEmission("2330".to_string()).is_recoverable());
  }
}
