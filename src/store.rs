//! Aggregate store: the single owner of every open [`AggregateRecord`].
//!
//! The store is a plain ordered map owned by one worker; serialization per key
//! comes from routing, not from locking. Records are handed out by value and
//! written back with [`AggregateStore::put`], so no other component ever holds
//! a reference into the map.
//!
//! The number of open windows is bounded. [`AggregateStore::get_or_create`]
//! refuses to open a new window once the bound is reached; existing windows can
//! always be read and updated.

use crate::aggregate::AggregateRecord;
use crate::error::{EngineError, EngineResult};
use crate::partitioning::PartitionKey;
use crate::window::{TimeWindow, WindowKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Keyed map from [`WindowKey`] to open aggregate records.
#[derive(Debug, Clone)]
pub struct AggregateStore {
  records: BTreeMap<WindowKey, AggregateRecord>,
  max_active_windows: usize,
}

impl AggregateStore {
  /// Creates an empty store holding at most `max_active_windows` records.
  pub fn new(max_active_windows: usize) -> Self {
    Self {
      records: BTreeMap::new(),
      max_active_windows,
    }
  }

  /// Returns the record for `key`, or a zero-valued record with the key's
  /// boundaries if none exists yet.
  ///
  /// A newly created record is inserted immediately, so it counts against the
  /// bound even before the first [`put`](Self::put).
  pub fn get_or_create(&mut self, key: &WindowKey, now: DateTime<Utc>) -> EngineResult<AggregateRecord> {
    if let Some(record) = self.records.get(key) {
      return Ok(record.clone());
    }
    if self.is_full() {
      return Err(EngineError::CapacityExceeded {
        limit: self.max_active_windows,
      });
    }
    let record = AggregateRecord::empty(key, now);
    self.records.insert(key.clone(), record.clone());
    Ok(record)
  }

  /// Stores `record` under `key`, replacing any previous state.
  pub fn put(&mut self, key: WindowKey, record: AggregateRecord) {
    self.records.insert(key, record);
  }

  /// Returns a copy of the record for `key`.
  pub fn get(&self, key: &WindowKey) -> Option<AggregateRecord> {
    self.records.get(key).cloned()
  }

  /// Returns true if `key` has an open record.
  pub fn contains(&self, key: &WindowKey) -> bool {
    self.records.contains_key(key)
  }

  /// Removes and returns the record for `key`. Removing an absent key is a
  /// no-op that returns `None`.
  pub fn remove(&mut self, key: &WindowKey) -> Option<AggregateRecord> {
    self.records.remove(key)
  }

  /// Iterates over records matching `predicate`, in key order.
  pub fn scan<'a, P>(&'a self, mut predicate: P) -> impl Iterator<Item = (&'a WindowKey, &'a AggregateRecord)> + 'a
  where
    P: FnMut(&WindowKey, &AggregateRecord) -> bool + 'a,
  {
    self
      .records
      .iter()
      .filter(move |entry| predicate(entry.0, entry.1))
  }

  /// Keys of every open window belonging to `partition`, oldest first.
  pub fn keys_for(&self, partition: &PartitionKey) -> Vec<WindowKey> {
    let lowest = WindowKey::time(
      partition.clone(),
      TimeWindow::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MIN_UTC),
    );
    self
      .records
      .range((Bound::Included(lowest), Bound::Unbounded))
      .take_while(|(key, _)| &key.partition == partition)
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Removes every record, returning them in key order.
  pub fn take_all(&mut self) -> Vec<(WindowKey, AggregateRecord)> {
    std::mem::take(&mut self.records).into_iter().collect()
  }

  /// Number of open records.
  pub fn len(&self) -> usize {
    self.records.len()
  }

  /// Returns true if no records are open.
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Returns true if no new window can be opened.
  pub fn is_full(&self) -> bool {
    self.records.len() >= self.max_active_windows
  }

  /// Configured bound on open records.
  pub fn capacity(&self) -> usize {
    self.max_active_windows
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()
  }

  fn key(symbol: &str, offset_secs: i64) -> WindowKey {
    let start = t0() + Duration::seconds(offset_secs);
    WindowKey::time(
      PartitionKey::new(symbol, "5s"),
      TimeWindow::new(start, start + Duration::seconds(5)),
    )
  }

  #[test]
  fn test_get_or_create_initializes_zero_record() {
    let mut store = AggregateStore::new(4);
    let record = store.get_or_create(&key("2330", 0), t0()).unwrap();
    assert!(record.is_empty());
    assert_eq!(record.start, t0());
    assert_eq!(store.len(), 1);

    // A second call returns the same entry rather than a new one.
    store.get_or_create(&key("2330", 0), t0()).unwrap();
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_put_then_get() {
    let mut store = AggregateStore::new(4);
    let k = key("2330", 0);
    let mut record = store.get_or_create(&k, t0()).unwrap();
    record.window_data_count = 7;
    store.put(k.clone(), record);
    assert_eq!(store.get(&k).unwrap().window_data_count, 7);
  }

  #[test]
  fn test_remove_is_idempotent() {
    let mut store = AggregateStore::new(4);
    let k = key("2330", 0);
    store.get_or_create(&k, t0()).unwrap();
    assert!(store.remove(&k).is_some());
    assert!(store.remove(&k).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_capacity_bound() {
    let mut store = AggregateStore::new(2);
    store.get_or_create(&key("A", 0), t0()).unwrap();
    store.get_or_create(&key("A", 5), t0()).unwrap();
    let err = store.get_or_create(&key("A", 10), t0()).unwrap_err();
    assert_eq!(err, EngineError::CapacityExceeded { limit: 2 });

    // Existing windows stay reachable at the bound.
    assert!(store.get_or_create(&key("A", 0), t0()).is_ok());
  }

  #[test]
  fn test_keys_for_partition_and_scan() {
    let mut store = AggregateStore::new(8);
    for k in [key("A", 5), key("B", 0), key("A", 0), key("C", 0)] {
      store.get_or_create(&k, t0()).unwrap();
    }
    let keys = store.keys_for(&PartitionKey::new("A", "5s"));
    assert_eq!(keys, vec![key("A", 0), key("A", 5)]);

    let late: Vec<_> = store
      .scan(|k, _| k.partition.symbol != "A")
      .map(|(k, _)| k.partition.symbol.clone())
      .collect();
    assert_eq!(late, vec!["B".to_string(), "C".to_string()]);
  }
}
