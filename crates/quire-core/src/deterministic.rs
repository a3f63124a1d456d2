//! Settings for reproducible ids, timestamps and counters.

use serde::{Deserialize, Serialize};

/// When enabled, every id and timestamp the engine generates is derived from
/// a persisted counter instead of randomness and the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterministicConfig {
  pub enabled:            bool,
  /// Timestamp of sequence number 0; each number adds one millisecond.
  pub start_timestamp_ms: i64,
}

impl Default for DeterministicConfig {
  fn default() -> Self {
    Self {
      enabled:            true,
      // 2024-01-01T00:00:00Z
      start_timestamp_ms: 1_704_067_200_000,
    }
  }
}
