//! Error types for latency measurement runs.
//!
//! Rejected samples (tick change, outlier, clock anomaly, failed operation)
//! are not errors: they are recovered locally by the sampler and reported as
//! [`RejectReason`](crate::sampler::RejectReason) counters. This enum only
//! covers conditions that prevent a result from being produced at all.

use std::io;

/// Errors produced by `tickgate`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The accumulator holds no accepted samples, so no mean can be computed.
    #[error("no accepted samples (every attempt was rejected or failed)")]
    NoAcceptedSamples,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signal slots carry non-zero payloads only; zero means "not yet signalled".
    #[error("signal payload must be non-zero")]
    ZeroPayload,

    /// A signal slot or core index is outside the channel.
    #[error("slot {index} out of range (channel has {len} slots)")]
    SlotOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of slots in the channel.
        len: usize,
    },

    /// A core's thread panicked before producing its result.
    #[error("thread for core {core} panicked")]
    CorePanicked {
        /// Logical core index.
        core: usize,
    },

    /// Reading or writing a configuration/report file failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A configuration/report file is not valid JSON for the expected type.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
