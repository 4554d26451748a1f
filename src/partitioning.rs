//! # Partitioning
//!
//! Every event belongs to exactly one **partition key**: the symbol plus the
//! window-type discriminator (e.g. `"2330"` + `"5-second"`). All window state for
//! a key is owned by one worker, so the key also decides routing: the engine
//! sends every event for a key to the worker returned by [`shard_for_key`].
//!
//! ```rust
//! use tickweave::partitioning::{PartitionKey, shard_for_key};
//!
//! let key = PartitionKey::new("2330", "5-second");
//! let worker = shard_for_key(&key, 4);
//! assert!(worker < 4);
//! assert_eq!(worker, shard_for_key(&key, 4));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Partition key that determines which worker owns a series.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
  /// Instrument symbol, e.g. `"2330"`.
  pub symbol: String,
  /// Window-type label, e.g. `"60s/30s"` or `"10-tick"`.
  pub window_type: String,
}

impl PartitionKey {
  /// Creates a new partition key.
  pub fn new(symbol: impl Into<String>, window_type: impl Into<String>) -> Self {
    Self {
      symbol: symbol.into(),
      window_type: window_type.into(),
    }
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}_{}", self.symbol, self.window_type)
  }
}

/// Maps a key to a worker index in `0..total`.
///
/// Stable for the lifetime of the process, which is all the engine needs: the
/// mapping only has to keep one key on one worker while that worker runs.
/// Returns 0 when `total` is 0.
pub fn shard_for_key(key: &PartitionKey, total: usize) -> usize {
  if total == 0 {
    return 0;
  }
  let mut hasher = DefaultHasher::new();
  key.hash(&mut hasher);
  (hasher.finish() % total as u64) as usize
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_display_joins_symbol_and_window_type() {
    let key = PartitionKey::new("2330", "5-second");
    assert_eq!(key.to_string(), "2330_5-second");
  }

  #[test]
  fn test_shard_for_key_is_stable_and_in_range() {
    for i in 0..200 {
      let key = PartitionKey::new(format!("{}", 1000 + i), "10-tick");
      let shard = shard_for_key(&key, 3);
      assert!(shard < 3);
      assert_eq!(shard, shard_for_key(&key.clone(), 3));
    }
  }

  #[test]
  fn test_shard_for_key_spreads_keys() {
    let shards: HashSet<usize> = (0..100)
      .map(|i| shard_for_key(&PartitionKey::new(format!("S{}", i), "60s"), 4))
      .collect();
    assert!(shards.len() > 1);
  }

  #[test]
  fn test_window_type_is_part_of_key() {
    let a = PartitionKey::new("2330", "5-second");
    let b = PartitionKey::new("2330", "10-tick");
    assert_ne!(a, b);
  }

  #[test]
  fn test_zero_total_maps_to_zero() {
    assert_eq!(shard_for_key(&PartitionKey::new("x", "y"), 0), 0);
  }
}
