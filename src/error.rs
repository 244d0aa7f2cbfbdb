//! Crate-wide error types.
//!
//! Only configuration failures and resource exhaustion during warm-up are
//! modeled as `Error`. Steady-state recoverable conditions (pool-full on
//! recycle, allocation failure on push, TX ring full) are *not* errors: they
//! are counters and `tracing` events, per the error handling policy.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch capacity must be non-zero")]
    ZeroCapacity,
    #[error("slice range end {end} precedes begin {begin}")]
    InvalidSliceRange { begin: usize, end: usize },
    #[error("annotation range end {end} precedes begin {begin}")]
    InvalidAnnoRange { begin: usize, end: usize },
    #[error("requested annotation window [{begin}, {end}) does not fit in stride {stride}")]
    AnnoStrideOverflow {
        begin: usize,
        end: usize,
        stride: usize,
    },
    #[error("LPM node stride must be 1, 2 or 4 bits, got {nbits}")]
    InvalidLpmBits { nbits: u8 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("resource exhausted allocating {what}")]
    ResourceExhausted { what: &'static str },

    #[error("invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;
