//! Configuration for samplers and multi-core runs.
//!
//! Baselines, outlier ceilings and quiescence delays are platform-calibrated
//! numbers. They are inputs here, never constants baked into the sampler:
//! the presets below only carry reference calibrations (a 40-core x86 server)
//! as starting points.
//!
//! Builder methods panic on out-of-range values, mirroring how a test author
//! wants a typo to fail loudly. Configurations loaded from JSON go through
//! [`RunConfig::validate`] instead and return [`Error::InvalidConfig`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default busy-wait after a tick-invalidated window, in cycles.
pub const DEFAULT_QUIESCENCE_CYCLES: u64 = 10_000;

/// Default allowed relative distance between measured mean and baseline.
pub const DEFAULT_DRIFT_TOLERANCE: f64 = 0.05;

/// Default number of completed iterations per test (1 << 20).
pub const DEFAULT_SAMPLES: usize = 1 << 20;

/// Ceiling used by the cross-core tests to reject firmware (SMI) interruptions.
pub const CROSS_CORE_OUTLIER_CEILING: u64 = 50_000;

/// What to do with a sample whose operation returned a non-zero code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The result code is meaningless; every sample is a candidate.
    ///
    /// Opt-in only. Closures without a result code should be wrapped with
    /// [`infallible`](crate::sampler::infallible) instead.
    Ignore,
    /// Discard the sample and retry without advancing the loop.
    Retry,
    /// Advance the loop and count the failure, but keep it out of the statistics.
    #[default]
    CountSeparately,
}

/// Parameters of one quiescence-filtered measurement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Completed iterations to collect (accepted plus separately counted failures).
    pub samples: usize,

    /// Upper bound on attempts, including rejected ones.
    ///
    /// `None` retries until `samples` iterations completed. With a bound the
    /// loop may end early and report fewer accepted samples.
    pub max_attempts: Option<usize>,

    /// Unmeasured iterations before the loop starts.
    pub warmup: usize,

    /// A-priori expected mean in cycles (reference for variance and drift).
    pub baseline: u64,

    /// Samples above this many cycles are rejected as outliers.
    pub outlier_ceiling: u64,

    /// Busy-wait after a tick-invalidated window before retrying.
    pub quiescence_cycles: u64,

    /// Busy-wait inside the window, after the operation and before the closing tick.
    pub settle_cycles: u64,

    /// Handling of non-zero operation result codes.
    pub failure_policy: FailurePolicy,

    /// Relative mean/baseline difference that triggers a drift warning.
    pub drift_tolerance: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            max_attempts: None,
            warmup: 0,
            baseline: 0,
            outlier_ceiling: u64::MAX,
            quiescence_cycles: 0,
            settle_cycles: 0,
            failure_policy: FailurePolicy::CountSeparately,
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
        }
    }
}

impl SamplerConfig {
    /// Default configuration: 1 << 20 samples, no ceiling, no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Same-core synchronous IPC round trip.
    pub fn pingpong() -> Self {
        Self::new().baseline(638)
    }

    /// Cross-core asynchronous send, reply observed through a signal slot.
    pub fn ipi() -> Self {
        Self::new()
            .baseline(18_122)
            .outlier_ceiling(CROSS_CORE_OUTLIER_CEILING)
            .quiescence_cycles(DEFAULT_QUIESCENCE_CYCLES)
    }

    /// Cross-core round trip while other cores generate page-table load.
    pub fn response() -> Self {
        Self::ipi().baseline(3_000)
    }

    /// Capability-table entry activation, followed by deactivation and quiescence.
    pub fn cap_activate() -> Self {
        Self::new()
            .baseline(800)
            .settle_cycles(DEFAULT_QUIESCENCE_CYCLES)
            .failure_policy(FailurePolicy::CountSeparately)
    }

    /// Thread switch whose end timestamp is written by the target thread.
    pub fn thread_switch() -> Self {
        Self::new().baseline(463)
    }

    /// Paired page map/unmap (forward baseline; reverse baseline 3248).
    pub fn mem_map() -> Self {
        Self::new()
            .baseline(2_749)
            .quiescence_cycles(DEFAULT_QUIESCENCE_CYCLES)
            .failure_policy(FailurePolicy::CountSeparately)
    }

    /// Paired page-table construct/deconstruct (reverse baseline 328).
    pub fn pgtbl_cons() -> Self {
        Self::new()
            .baseline(337)
            .quiescence_cycles(DEFAULT_QUIESCENCE_CYCLES)
    }

    /// Paired capability-table construct/deconstruct (reverse baseline 48878).
    pub fn captbl_cons() -> Self {
        Self::new()
            .baseline(62_518)
            .quiescence_cycles(DEFAULT_QUIESCENCE_CYCLES)
    }

    /// Set completed iterations.
    pub fn samples(mut self, n: usize) -> Self {
        assert!(n > 0, "samples must be > 0");
        self.samples = n;
        self
    }

    /// Bound the number of attempts.
    pub fn max_attempts(mut self, n: usize) -> Self {
        assert!(n > 0, "max_attempts must be > 0");
        self.max_attempts = Some(n);
        self
    }

    /// Set unmeasured warmup iterations.
    pub fn warmup(mut self, n: usize) -> Self {
        self.warmup = n;
        self
    }

    /// Set the a-priori expected mean.
    pub fn baseline(mut self, cycles: u64) -> Self {
        self.baseline = cycles;
        self
    }

    /// Set the outlier ceiling.
    pub fn outlier_ceiling(mut self, cycles: u64) -> Self {
        assert!(cycles > 0, "outlier_ceiling must be > 0");
        self.outlier_ceiling = cycles;
        self
    }

    /// Set the post-interrupt busy-wait.
    pub fn quiescence_cycles(mut self, cycles: u64) -> Self {
        self.quiescence_cycles = cycles;
        self
    }

    /// Set the in-window settle delay.
    pub fn settle_cycles(mut self, cycles: u64) -> Self {
        self.settle_cycles = cycles;
        self
    }

    /// Set the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the drift tolerance.
    pub fn drift_tolerance(mut self, tolerance: f64) -> Self {
        assert!(
            tolerance.is_finite() && tolerance >= 0.0,
            "drift_tolerance must be finite and >= 0"
        );
        self.drift_tolerance = tolerance;
        self
    }

    /// Check values that bypassed the builder (e.g. deserialised ones).
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            return Err(invalid("samples must be > 0"));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be > 0"));
        }
        if self.outlier_ceiling == 0 {
            return Err(invalid("outlier_ceiling must be > 0"));
        }
        if !(self.drift_tolerance.is_finite() && self.drift_tolerance >= 0.0) {
            return Err(invalid("drift_tolerance must be finite and >= 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidConfig(msg.to_string())
}

// =============================================================================
// Run configuration
// =============================================================================

/// Host workload measured by the primary core(s).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Workload {
    /// An empty operation: measures the sampler's own floor.
    #[default]
    Null,
    /// A busy loop of fixed length.
    Spin {
        /// Iterations of the loop.
        iterations: u32,
    },
    /// Signal a receiver core and wait for its timestamped reply.
    RoundTrip,
    /// Round trip in lock-step with a designated flusher while the
    /// remaining cores generate allocation load.
    Response,
    /// Paired page-sized allocation (forward) and release (reverse).
    AllocFree,
}

/// What cores that do not drive the primary test do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Background {
    /// Spin on the completion flag.
    #[default]
    Idle,
    /// Run allocation/release rounds gated by tick rendezvous.
    Interfere,
}

/// How a receiver's reply payload is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// The payload is the receiver's timestamp; elapsed is `min(payload, end) - start`.
    #[default]
    Timestamp,
    /// The payload is an opaque non-zero sentinel; elapsed is `end - start`.
    Sentinel,
}

/// Full description of one multi-core benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Participating cores (threads), all of which enter the start barrier.
    pub cores: usize,
    /// Cores `0..primaries` drive the primary measurement.
    pub primaries: usize,
    /// Receiver of primary core `c` is core `c + signal_offset`.
    pub signal_offset: usize,
    /// Operation measured by the primaries.
    pub workload: Workload,
    /// Role of the remaining cores.
    pub background: Background,
    /// Reply payload interpretation for round-trip workloads.
    pub payload: PayloadKind,
    /// Sampler parameters for the primary measurement.
    pub sampler: SamplerConfig,
    /// Baseline of the reverse half of paired workloads.
    pub reverse_baseline: u64,
    /// Period of the emulated timer tick in microseconds (0 disables it).
    pub tick_period_us: u64,
    /// Text emitted at every flush point, if any.
    pub flush_marker: Option<String>,
    /// Pin core `i` to CPU `i` when possible.
    pub pin_cores: bool,
    /// Also report the unfiltered average over `sampler.samples` calls.
    pub unfiltered: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cores: 2,
            primaries: 1,
            signal_offset: 1,
            workload: Workload::Null,
            background: Background::Idle,
            payload: PayloadKind::Timestamp,
            sampler: SamplerConfig::default(),
            reverse_baseline: 0,
            tick_period_us: 1_000,
            flush_marker: None,
            pin_cores: true,
            unfiltered: false,
        }
    }
}

impl RunConfig {
    /// Default two-core configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON configuration and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a JSON configuration and validate it.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialise as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set the participant count.
    pub fn cores(mut self, n: usize) -> Self {
        assert!(n > 0, "cores must be > 0");
        self.cores = n;
        self
    }

    /// Set the number of primary cores.
    pub fn primaries(mut self, n: usize) -> Self {
        assert!(n > 0, "primaries must be > 0");
        self.primaries = n;
        self
    }

    /// Set the sender/receiver offset.
    pub fn signal_offset(mut self, offset: usize) -> Self {
        assert!(offset > 0, "signal_offset must be > 0");
        self.signal_offset = offset;
        self
    }

    /// Set the workload.
    pub fn workload(mut self, workload: Workload) -> Self {
        self.workload = workload;
        self
    }

    /// Set the background role.
    pub fn background(mut self, background: Background) -> Self {
        self.background = background;
        self
    }

    /// Set the reply payload interpretation.
    pub fn payload(mut self, payload: PayloadKind) -> Self {
        self.payload = payload;
        self
    }

    /// Set the sampler configuration.
    pub fn sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    /// Set the reverse baseline for paired workloads.
    pub fn reverse_baseline(mut self, cycles: u64) -> Self {
        self.reverse_baseline = cycles;
        self
    }

    /// Set the emulated tick period in microseconds (0 disables).
    pub fn tick_period_us(mut self, us: u64) -> Self {
        self.tick_period_us = us;
        self
    }

    /// Emit `marker` at every flush point.
    pub fn flush_marker(mut self, marker: impl Into<String>) -> Self {
        self.flush_marker = Some(marker.into());
        self
    }

    /// Enable or disable CPU pinning.
    pub fn pin_cores(mut self, pin: bool) -> Self {
        self.pin_cores = pin;
        self
    }

    /// Enable or disable the unfiltered comparison pass.
    pub fn unfiltered(mut self, enabled: bool) -> Self {
        self.unfiltered = enabled;
        self
    }

    /// Whether the workload needs a receiver per primary.
    pub fn needs_receivers(&self) -> bool {
        matches!(self.workload, Workload::RoundTrip | Workload::Response)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        if self.cores == 0 {
            return Err(invalid("cores must be > 0"));
        }
        if self.primaries == 0 || self.primaries > self.cores {
            return Err(invalid("primaries must be in 1..=cores"));
        }
        if self.signal_offset == 0 {
            return Err(invalid("signal_offset must be > 0"));
        }
        if self.needs_receivers() {
            if self.signal_offset < self.primaries {
                return Err(invalid("signal_offset must be >= primaries"));
            }
            if self.primaries - 1 + self.signal_offset >= self.cores {
                return Err(invalid("every primary needs a receiver core"));
            }
        }
        if self.workload == Workload::Response && self.primaries != 1 {
            return Err(invalid("the response workload drives exactly one primary"));
        }
        if self.workload == Workload::Response && self.cores < 3 {
            return Err(invalid("the response workload needs a flusher core"));
        }
        if self.workload == Workload::Response && self.tick_period_us == 0 {
            return Err(invalid("the response workload needs a tick source"));
        }
        if self.background == Background::Interfere && self.tick_period_us == 0 {
            return Err(invalid("interference rounds need a tick source"));
        }
        Ok(())
    }
}
