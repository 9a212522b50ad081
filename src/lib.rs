//! # tickgate
//!
//! Cycle-accurate latency measurement for multi-core micro-benchmarks,
//! filtered against interrupt contamination.
//!
//! Every sample is bracketed by two observations of a coarse interrupt epoch
//! counter (the *tick*). A sample whose window saw the tick advance, whose
//! operation failed, whose clock went backwards or whose cost exceeds the
//! outlier ceiling is discarded and retried. Accepted samples accumulate into
//! mean, maximum and mean squared deviation from an a-priori baseline.
//!
//! The crate also provides the cross-core plumbing such benchmarks need: a
//! reusable start barrier, cache-line partitioned signal slots, a completion
//! flag and tick-gated interference generators.
//!
//! ## Common Pitfall: Work Outside the Window
//!
//! Everything the operation closure does is measured. Allocate inputs and
//! reset shared state outside it, or in [`Probe::prepare`], which runs before
//! the opening tick observation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tickgate::{ContextSwitchTick, Sampler, SamplerConfig, Tsc};
//!
//! let sampler = Sampler::new(Tsc, ContextSwitchTick, SamplerConfig::pingpong().samples(10_000));
//! let report = sampler.run("null", || 0);
//!
//! match report.summary() {
//!     Ok(s) => println!("avg {:.0}, max {}, stddev^2 {:.0}", s.mean, s.max, s.variance),
//!     Err(e) => println!("no result: {}", e),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod clock;
pub mod config;
pub mod error;
pub mod sampler;
pub mod stats;
pub mod tick;

// Cross-core plumbing
pub mod barrier;
pub mod completion;
pub mod interference;
pub mod roundtrip;
pub mod signal;

// Host runner and reporting
pub mod affinity;
pub mod harness;
pub mod output;
pub mod sim;

// Re-exports for public API
pub use barrier::CoreBarrier;
pub use clock::{cycles_per_ns, CycleClock, CycleTimestamp, Tsc};
pub use completion::CompletionFlag;
pub use config::{Background, FailurePolicy, PayloadKind, RunConfig, SamplerConfig, Workload};
pub use error::{Error, Result};
pub use harness::{CoreOutcome, CoreReport, Measurement, Role, RunReport};
pub use interference::{FlushHandshake, InterferenceStats, Interferer};
pub use roundtrip::{Responder, RoundTripProbe};
pub use sampler::{
    checked, infallible, Operation, Pair, PairedOperation, PairedReport, Probe, RejectReason, Rejections,
    ResultCode, Sample, Sampler, SamplerReport, Timed, Verdict, Warning, Window,
};
pub use signal::{SignalChannel, Slot};
pub use stats::{Accumulator, BaselineDrift, LatencySummary};
pub use tick::{
    wait_for_tick_edge, BufferSink, ContextSwitchTick, DiagnosticSink, FlushPoint, NullSink,
    SharedTick, StdoutSink, Tick, TickOracle, TickSource, TracingSink,
};

/// Return early from a test when the host cannot filter by tick.
///
/// Without per-thread context-switch accounting the only remaining filter is
/// the outlier ceiling, which is too weak for tight latency assertions.
///
/// # Example
/// ```ignore
/// #[test]
/// fn tight_bound() {
///     tickgate::skip_without_tick!("tight_bound");
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! skip_without_tick {
    ($name:expr) => {
        if !$crate::ContextSwitchTick::available() {
            eprintln!("[{}] skipped: context-switch tick unavailable", $name);
            return;
        }
    };
}
