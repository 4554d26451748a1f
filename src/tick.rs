//! Input events and their wire decoding.
//!
//! The engine consumes two kinds of [`Event`]:
//!
//! - [`RawTick`]: one observation for a symbol (VWAP contribution, traded size,
//!   real or gap-filled).
//! - [`PartialAggregate`]: an upstream pre-aggregated bucket (partial sums and
//!   counts) that is combined into a window as a whole.
//!
//! Both arrive as JSON objects using the feed's field names (`symbol`, `type`,
//! `MA_type`, ...). A message carrying `sum_of_vwap` is a partial, anything else
//! is a tick. Decoding failures are [`EngineError::MalformedEvent`]; the caller
//! drops the event and keeps going.

use crate::error::{EngineError, EngineResult};
use crate::partitioning::PartitionKey;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observation for a symbol at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
  /// Instrument symbol.
  pub symbol: String,
  /// Instrument type (e.g. `"stock"`).
  pub instrument_type: String,
  /// Window-type discriminator carried by the feed, if any.
  pub window_type: Option<String>,
  /// Event time.
  pub timestamp: DateTime<Utc>,
  /// VWAP contribution for the observation interval.
  pub vwap: f64,
  /// Traded size during the interval; zero for ticks with no trades.
  pub size: f64,
  /// True for synthetically gap-filled ticks.
  pub filled: bool,
}

impl RawTick {
  /// Creates a real tick with the given price and size.
  pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, vwap: f64, size: f64) -> Self {
    Self {
      symbol: symbol.into(),
      instrument_type: String::new(),
      window_type: None,
      timestamp,
      vwap,
      size,
      filled: false,
    }
  }

  /// Marks the tick as gap-filled.
  pub fn filled(mut self) -> Self {
    self.filled = true;
    self
  }

  /// Sets the instrument type.
  pub fn with_instrument_type(mut self, instrument_type: impl Into<String>) -> Self {
    self.instrument_type = instrument_type.into();
    self
  }

  /// Sets the window-type discriminator.
  pub fn with_window_type(mut self, window_type: impl Into<String>) -> Self {
    self.window_type = Some(window_type.into());
    self
  }
}

/// Pre-aggregated contribution from an upstream stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialAggregate {
  /// Instrument symbol.
  pub symbol: String,
  /// Instrument type.
  pub instrument_type: String,
  /// Window-type discriminator carried by the feed, if any.
  pub window_type: Option<String>,
  /// Event time used for window assignment.
  pub timestamp: DateTime<Utc>,
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

impl PartialAggregate {
  /// Checks the counter invariants a record must keep.
  pub fn validate(&self) -> EngineResult<()> {
    if self.real_data_count + self.filled_data_count != self.window_data_count {
      return Err(EngineError::malformed(format!(
        "partial for {}: real ({}) + filled ({}) != window_data_count ({})",
        self.symbol, self.real_data_count, self.filled_data_count, self.window_data_count
      )));
    }
    if self.count_of_vwap > self.window_data_count {
      return Err(EngineError::malformed(format!(
        "partial for {}: count_of_vwap ({}) exceeds window_data_count ({})",
        self.symbol, self.count_of_vwap, self.window_data_count
      )));
    }
    if !self.sum_of_vwap.is_finite() {
      return Err(EngineError::malformed(format!(
        "partial for {}: sum_of_vwap is not finite",
        self.symbol
      )));
    }
    Ok(())
  }
}

/// An input event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// A single observation.
  Tick(RawTick),
  /// A pre-aggregated bucket.
  Partial(PartialAggregate),
}

impl Event {
  /// Symbol of the event.
  pub fn symbol(&self) -> &str {
    match self {
      Event::Tick(t) => &t.symbol,
      Event::Partial(p) => &p.symbol,
    }
  }

  /// Instrument type of the event.
  pub fn instrument_type(&self) -> &str {
    match self {
      Event::Tick(t) => &t.instrument_type,
      Event::Partial(p) => &p.instrument_type,
    }
  }

  /// Event time.
  pub fn timestamp(&self) -> DateTime<Utc> {
    match self {
      Event::Tick(t) => t.timestamp,
      Event::Partial(p) => p.timestamp,
    }
  }

  /// Number of contributions this event adds to a window.
  pub fn contribution_count(&self) -> u64 {
    match self {
      Event::Tick(_) => 1,
      Event::Partial(p) => p.window_data_count,
    }
  }

  /// Partition key, falling back to `default_window_type` when the event does
  /// not carry its own discriminator.
  pub fn partition_key(&self, default_window_type: &str) -> PartitionKey {
    let window_type = match self {
      Event::Tick(t) => t.window_type.as_deref(),
      Event::Partial(p) => p.window_type.as_deref(),
    }
    .filter(|w| !w.is_empty())
    .unwrap_or(default_window_type);
    PartitionKey::new(self.symbol(), window_type)
  }
}

impl From<RawTick> for Event {
  fn from(tick: RawTick) -> Self {
    Event::Tick(tick)
  }
}

impl From<PartialAggregate> for Event {
  fn from(partial: PartialAggregate) -> Self {
    Event::Partial(partial)
  }
}

/// Wire shape of a tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickMessage {
  /// Instrument symbol.
  pub symbol: Option<String>,
  /// Instrument type.
  #[serde(rename = "type", default)]
  pub instrument_type: Option<String>,
  /// Window-type discriminator.
  #[serde(rename = "MA_type", default)]
  pub window_type: Option<String>,
  /// RFC 3339 string, `YYYY-MM-DD HH:MM:SS[.fff]` string, or epoch millis.
  #[serde(alias = "current_time", default)]
  pub timestamp: Option<Value>,
  /// VWAP contribution.
  pub vwap: Option<f64>,
  /// Traded size.
  #[serde(default)]
  pub size: Option<f64>,
  /// Gap-filled flag.
  #[serde(default)]
  pub is_filled: bool,
}

/// Wire shape of a partial aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialMessage {
  /// Instrument symbol.
  pub symbol: Option<String>,
  /// Instrument type.
  #[serde(rename = "type", default)]
  pub instrument_type: Option<String>,
  /// Window-type discriminator.
  #[serde(rename = "MA_type", default)]
  pub window_type: Option<String>,
  /// Event time, same formats as [`TickMessage::timestamp`].
  #[serde(alias = "current_time", default)]
  pub timestamp: Option<Value>,
  /// Sum of VWAP.
  pub sum_of_vwap: f64,
  /// Non-zero-size contributions.
  #[serde(default)]
  pub count_of_vwap: u64,
  /// Total contributions.
  #[serde(default)]
  pub window_data_count: u64,
  /// Real contributions.
  #[serde(default)]
  pub real_data_count: u64,
  /// Gap-filled contributions.
  #[serde(default)]
  pub filled_data_count: u64,
}

fn required_symbol(symbol: Option<String>) -> EngineResult<String> {
  symbol
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
    .ok_or_else(|| EngineError::malformed("missing symbol"))
}

impl TryFrom<TickMessage> for RawTick {
  type Error = EngineError;

  fn try_from(msg: TickMessage) -> EngineResult<Self> {
    let symbol = required_symbol(msg.symbol)?;
    let timestamp = match msg.timestamp {
      Some(value) => parse_timestamp(&value)?,
      None => return Err(EngineError::malformed(format!("tick for {}: missing timestamp", symbol))),
    };
    let vwap = msg
      .vwap
      .ok_or_else(|| EngineError::malformed(format!("tick for {}: missing vwap", symbol)))?;
    let size = msg.size.unwrap_or(0.0);
    if !vwap.is_finite() || !size.is_finite() {
      return Err(EngineError::malformed(format!(
        "tick for {}: vwap and size must be finite",
        symbol
      )));
    }
    Ok(RawTick {
      symbol,
      instrument_type: msg.instrument_type.unwrap_or_default(),
      window_type: msg.window_type,
      timestamp,
      vwap,
      size,
      filled: msg.is_filled,
    })
  }
}

impl TryFrom<PartialMessage> for PartialAggregate {
  type Error = EngineError;

  fn try_from(msg: PartialMessage) -> EngineResult<Self> {
    let symbol = required_symbol(msg.symbol)?;
    let timestamp = match msg.timestamp {
      Some(value) => parse_timestamp(&value)?,
      None => {
        return Err(EngineError::malformed(format!(
          "partial for {}: missing timestamp",
          symbol
        )))
      }
    };
    let partial = PartialAggregate {
      symbol,
      instrument_type: msg.instrument_type.unwrap_or_default(),
      window_type: msg.window_type,
      timestamp,
      sum_of_vwap: msg.sum_of_vwap,
      count_of_vwap: msg.count_of_vwap,
      window_data_count: msg.window_data_count,
      real_data_count: msg.real_data_count,
      filled_data_count: msg.filled_data_count,
    };
    partial.validate()?;
    Ok(partial)
  }
}

/// Parses an event timestamp.
///
/// Accepts RFC 3339 strings, `YYYY-MM-DD HH:MM:SS[.fff]` strings (taken as
/// UTC), and integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> EngineResult<DateTime<Utc>> {
  match value {
    Value::String(s) => {
      let s = s.trim();
      if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
      }
      NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| EngineError::malformed(format!("unparseable timestamp {:?}: {}", s, e)))
    }
    Value::Number(n) => n
      .as_i64()
      .and_then(DateTime::from_timestamp_millis)
      .ok_or_else(|| EngineError::malformed(format!("epoch timestamp out of range: {}", n))),
    other => Err(EngineError::malformed(format!(
      "timestamp must be a string or integer, got {}",
      other
    ))),
  }
}

/// Decodes one JSON message into an [`Event`].
pub fn decode_event(bytes: &[u8]) -> EngineResult<Event> {
  let value: Value =
    serde_json::from_slice(bytes).map_err(|e| EngineError::malformed(format!("invalid JSON: {}", e)))?;
  if !value.is_object() {
    return Err(EngineError::malformed("event must be a JSON object"));
  }
  if value.get("sum_of_vwap").is_some() {
    let msg: PartialMessage = serde_json::from_value(value)
      .map_err(|e| EngineError::malformed(format!("invalid partial: {}", e)))?;
    Ok(Event::Partial(PartialAggregate::try_from(msg)?))
  } else {
    let msg: TickMessage = serde_json::from_value(value)
      .map_err(|e| EngineError::malformed(format!("invalid tick: {}", e)))?;
    Ok(Event::Tick(RawTick::try_from(msg)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_decode_tick_rfc3339() {
    let event = decode_event(
      br#"{"symbol":"2330","type":"stock","MA_type":"5-second","timestamp":"2024-01-02T09:00:01Z","vwap":600.5,"size":100,"is_filled":false}"#,
    )
    .unwrap();
    let Event::Tick(tick) = event else {
      panic!("expected tick");
    };
    assert_eq!(tick.symbol, "2330");
    assert_eq!(tick.instrument_type, "stock");
    assert_eq!(tick.window_type.as_deref(), Some("5-second"));
    assert_eq!(tick.timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 1).unwrap());
    assert_eq!(tick.vwap, 600.5);
    assert!(!tick.filled);
  }

  #[test]
  fn test_decode_tick_naive_and_epoch_timestamps() {
    let naive = decode_event(br#"{"symbol":"2330","timestamp":"2024-01-02 09:00:01.250","vwap":1.0}"#)
      .unwrap();
    assert_eq!(
      naive.timestamp(),
      Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 1).unwrap() + chrono::Duration::milliseconds(250)
    );

    let epoch = decode_event(br#"{"symbol":"2330","timestamp":1704186001000,"vwap":1.0,"size":0}"#)
      .unwrap();
    assert_eq!(epoch.timestamp(), Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 1).unwrap());
  }

  #[test]
  fn test_decode_partial() {
    let event = decode_event(
      br#"{"symbol":"2330","MA_type":"5-second","current_time":"2024-01-02T09:00:01Z","sum_of_vwap":30.0,"count_of_vwap":2,"window_data_count":3,"real_data_count":2,"filled_data_count":1}"#,
    )
    .unwrap();
    let Event::Partial(partial) = event else {
      panic!("expected partial");
    };
    assert_eq!(partial.sum_of_vwap, 30.0);
    assert_eq!(partial.window_data_count, 3);
  }

  #[test]
  fn test_malformed_events() {
    let cases: [&[u8]; 7] = [
      b"not json",
      b"[1,2]",
      br#"{"timestamp":"2024-01-02T09:00:01Z","vwap":1.0}"#,
      br#"{"symbol":"  ","timestamp":"2024-01-02T09:00:01Z","vwap":1.0}"#,
      br#"{"symbol":"2330","timestamp":"yesterday","vwap":1.0}"#,
      br#"{"symbol":"2330","vwap":1.0}"#,
      br#"{"symbol":"2330","timestamp":"2024-01-02T09:00:01Z","sum_of_vwap":1.0,"window_data_count":2,"real_data_count":1}"#,
    ];
    for case in cases {
      let err = decode_event(case).unwrap_err();
      assert!(
        matches!(err, EngineError::MalformedEvent(_)),
        "{:?} -> {:?}",
        String::from_utf8_lossy(case),
        err
      );
    }
  }

  #[test]
  fn test_partition_key_defaults_window_type() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
    let plain: Event = RawTick::new("2330", ts, 1.0, 1.0).into();
    assert_eq!(plain.partition_key("60s/30s"), PartitionKey::new("2330", "60s/30s"));

    let labelled: Event = RawTick::new("2330", ts, 1.0, 1.0)
      .with_window_type("5-second")
      .into();
    assert_eq!(labelled.partition_key("60s/30s"), PartitionKey::new("2330", "5-second"));
  }
}
