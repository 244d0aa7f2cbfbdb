//! The Batcher's configuration surface (`spec.md` §6).
//!
//! Plain, comparable, serializable data — validated once by [`BatcherConfig::validate`]
//! before a [`crate::batcher::Batcher`] is built from it, rather than leaning on the
//! type system to make bad configurations unrepresentable.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of batches pre-filled into each per-thread pool.
pub const DEFAULT_BATCH_PREALLOC: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Per-batch maximum residency in milliseconds. `0` disables the timeout.
    pub timeout_ms: u64,
    /// Max packets per batch.
    pub capacity: usize,
    /// Default slice range begin, raw packet bytes. Ignored if `slice_end == 0`.
    pub slice_begin: usize,
    /// Default slice range end. `0` means "no default slice range registered".
    pub slice_end: usize,
    /// Default annotation window begin.
    pub ann_begin: usize,
    /// Default annotation window end. `0` means "no default annotation window".
    pub ann_end: usize,
    /// Always record per-packet length, even if no downstream stage requested it.
    pub force_pktlens: bool,
    /// Batches pre-filled into each pool at construction time.
    pub batch_prealloc: usize,
    /// Whether multiple threads call `push` concurrently on this Batcher.
    pub mt_pushers: bool,
    /// Verbose trace emission (mirrors the original `TEST` knob).
    pub test: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            capacity: 256,
            slice_begin: 0,
            slice_end: 0,
            ann_begin: 0,
            ann_end: 0,
            force_pktlens: false,
            batch_prealloc: DEFAULT_BATCH_PREALLOC,
            mt_pushers: false,
            test: false,
        }
    }
}

impl BatcherConfig {
    /// Reject configurations that cannot be turned into a valid [`Batcher`](crate::batcher::Batcher).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.slice_end != 0 && self.slice_end < self.slice_begin {
            return Err(ConfigError::InvalidSliceRange {
                begin: self.slice_begin,
                end: self.slice_end,
            });
        }
        if self.ann_end != 0 && self.ann_end < self.ann_begin {
            return Err(ConfigError::InvalidAnnoRange {
                begin: self.ann_begin,
                end: self.ann_end,
            });
        }
        Ok(())
    }

    pub fn has_default_slice_range(&self) -> bool {
        self.slice_end != 0
    }

    pub fn has_default_anno_window(&self) -> bool {
        self.ann_end != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let cfg = BatcherConfig {
            capacity: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    fn inverted_slice_range_rejected() {
        let cfg = BatcherConfig {
            slice_begin: 10,
            slice_end: 4,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidSliceRange { .. })
        ));
    }
}
