//! Tick-filtered sampling loop.
//!
//! Each attempt observes the tick, takes a start timestamp, runs one unit of
//! work, takes an end timestamp and observes the tick again. The sample is
//! accepted only if:
//!
//! 1. Both tick observations are equal (no interrupt serviced mid-window).
//! 2. The operation succeeded, when its result code is meaningful.
//! 3. `end >= start`.
//! 4. `end - start` does not exceed the outlier ceiling.
//!
//! Rejected attempts are retried without advancing the iteration count. After
//! a tick-invalidated window the sampler optionally busy-waits so the tail of
//! the interrupt does not bleed into the next window. Accepted samples fold
//! into an [`Accumulator`] owned by the calling core.

use serde::{Deserialize, Serialize};

use crate::clock::{CycleClock, CycleTimestamp};
use crate::config::{FailurePolicy, SamplerConfig};
use crate::error::{Error, Result};
use crate::stats::{Accumulator, BaselineDrift, LatencySummary};
use crate::tick::{Tick, TickOracle};

/// Operation result code; zero means success.
pub type ResultCode = i32;

/// A unit of work measured once per attempt.
pub trait Operation {
    /// Run the operation once.
    fn invoke(&mut self) -> ResultCode;
}

impl<F: FnMut() -> ResultCode> Operation for F {
    #[inline(always)]
    fn invoke(&mut self) -> ResultCode {
        self()
    }
}

/// Wrap a closure without a result code as an always-successful operation.
pub fn infallible<F: FnMut()>(mut f: F) -> impl FnMut() -> ResultCode {
    move || {
        f();
        0
    }
}

/// Wrap a closure reporting success as `true` (`false` becomes `-1`).
pub fn checked<F: FnMut() -> bool>(mut f: F) -> impl FnMut() -> ResultCode {
    move || if f() { 0 } else { -1 }
}

/// An operation with an inverse that restores the prior state.
pub trait PairedOperation {
    /// The measured forward half (e.g. map, construct).
    fn forward(&mut self) -> ResultCode;
    /// The inverse half (e.g. unmap, deconstruct).
    fn reverse(&mut self) -> ResultCode;
}

/// Two closures forming a [`PairedOperation`].
#[derive(Debug, Clone)]
pub struct Pair<F, R> {
    /// Forward half.
    pub forward: F,
    /// Reverse half.
    pub reverse: R,
}

impl<F, R> PairedOperation for Pair<F, R>
where
    F: FnMut() -> ResultCode,
    R: FnMut() -> ResultCode,
{
    fn forward(&mut self) -> ResultCode {
        (self.forward)()
    }

    fn reverse(&mut self) -> ResultCode {
        (self.reverse)()
    }
}

/// Start/end timestamps of one run of the measured work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Timestamp taken right before the work.
    pub start: CycleTimestamp,
    /// Timestamp taken right after it (or reported by another core).
    pub end: CycleTimestamp,
    /// Result code of the work.
    pub result: ResultCode,
}

/// Measures one window per attempt.
///
/// [`prepare`](Probe::prepare) runs before the opening tick observation and
/// is the place to reset signal slots or request a flush.
pub trait Probe<C: ?Sized> {
    /// Untimed setup for the next attempt.
    fn prepare(&mut self) {}

    /// Take the start timestamp, run the work and take the end timestamp.
    fn measure(&mut self, clock: &C) -> Window;
}

/// Probe timing a single [`Operation`] between two clock reads.
#[derive(Debug)]
pub struct Timed<O>(pub O);

impl<C: CycleClock + ?Sized, O: Operation> Probe<C> for Timed<O> {
    #[inline]
    fn measure(&mut self, clock: &C) -> Window {
        let start = clock.now();
        let result = self.0.invoke();
        let end = clock.now();
        Window { start, end, result }
    }
}

/// One attempt: the window plus the bracketing tick observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Window measured by the probe.
    pub window: Window,
    /// Tick observed before the start timestamp.
    pub tick_before: Tick,
    /// Tick observed after the end timestamp.
    pub tick_after: Tick,
}

impl Sample {
    /// `end - start`, or `None` if the counter went backwards.
    pub fn elapsed(&self) -> Option<u64> {
        self.window.end.checked_sub(self.window.start)
    }

    /// Classify this sample under `config`.
    pub fn validate(&self, config: &SamplerConfig) -> Verdict {
        if self.tick_before != self.tick_after {
            return Verdict::Retry(RejectReason::TickChanged);
        }
        if self.window.result != 0 {
            match config.failure_policy {
                FailurePolicy::Ignore => {}
                FailurePolicy::Retry => return Verdict::Retry(RejectReason::Failed),
                FailurePolicy::CountSeparately => return Verdict::Failed,
            }
        }
        match self.elapsed() {
            None => Verdict::Retry(RejectReason::ClockAnomaly),
            Some(cycles) if cycles > config.outlier_ceiling => {
                Verdict::Retry(RejectReason::Outlier)
            }
            Some(cycles) => Verdict::Accept(cycles),
        }
    }
}

/// Why a sample was discarded and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// An interrupt was serviced inside the window.
    TickChanged,
    /// The operation returned a non-zero code under [`FailurePolicy::Retry`].
    Failed,
    /// The end timestamp preceded the start timestamp.
    ClockAnomaly,
    /// The sample exceeded the outlier ceiling.
    Outlier,
}

/// Outcome of validating one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Recorded in the statistics; advances the loop.
    Accept(u64),
    /// Counted as a failure; advances the loop without touching the statistics.
    Failed,
    /// Discarded; the loop does not advance.
    Retry(RejectReason),
}

/// Per-reason rejection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejections {
    /// Tick changed mid-window.
    pub tick_changed: u64,
    /// Non-zero result code, retried.
    pub failed: u64,
    /// `end < start`.
    pub clock_anomaly: u64,
    /// Above the outlier ceiling.
    pub outlier: u64,
}

impl Rejections {
    fn record(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::TickChanged => self.tick_changed += 1,
            RejectReason::Failed => self.failed += 1,
            RejectReason::ClockAnomaly => self.clock_anomaly += 1,
            RejectReason::Outlier => self.outlier += 1,
        }
    }

    /// Total rejected attempts.
    pub fn total(&self) -> u64 {
        self.tick_changed + self.failed + self.clock_anomaly + self.outlier
    }
}

/// Non-fatal conditions found while running or finalising a loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Warning {
    /// Every attempt was rejected; there are no statistics.
    NoAcceptedSamples,
    /// The attempt budget ran out before the target was reached.
    AttemptBudgetExhausted {
        /// Iterations completed.
        completed: u64,
        /// Iterations requested.
        target: u64,
    },
    /// The measured mean is inconsistent with the baseline.
    BaselineDrift(BaselineDrift),
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::NoAcceptedSamples => write!(f, "no sample accepted, statistics unavailable"),
            Warning::AttemptBudgetExhausted { completed, target } => write!(
                f,
                "attempt budget exhausted after {} of {} iterations",
                completed, target
            ),
            Warning::BaselineDrift(drift) => write!(f, "{}", drift),
        }
    }
}

/// Everything one measurement loop produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerReport {
    /// Label of the measured operation.
    pub name: String,
    /// Attempts made, including rejected ones.
    pub attempts: u64,
    /// Iterations completed (accepted plus separately counted failures).
    pub completed: u64,
    /// Samples folded into the statistics.
    pub accepted: u64,
    /// Failures counted under [`FailurePolicy::CountSeparately`].
    pub failed: u64,
    /// Discarded attempts by reason.
    pub rejected: Rejections,
    /// Statistics, absent when nothing was accepted.
    pub summary: Option<LatencySummary>,
    /// Non-fatal findings.
    pub warnings: Vec<Warning>,
}

impl SamplerReport {
    /// Statistics, or [`Error::NoAcceptedSamples`].
    pub fn summary(&self) -> Result<&LatencySummary> {
        self.summary.as_ref().ok_or(Error::NoAcceptedSamples)
    }

    /// Whether the mean drifted away from the baseline.
    pub fn drifted(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, Warning::BaselineDrift(_)))
    }
}

/// Forward and reverse halves of a paired measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedReport {
    /// Forward half.
    pub forward: SamplerReport,
    /// Reverse half.
    pub reverse: SamplerReport,
}

/// Running state of one loop, finalised into a [`SamplerReport`].
struct Tally {
    acc: Accumulator,
    attempts: u64,
    completed: u64,
    failed: u64,
    rejected: Rejections,
}

impl Tally {
    fn new(baseline: u64) -> Self {
        Self {
            acc: Accumulator::new(baseline),
            attempts: 0,
            completed: 0,
            failed: 0,
            rejected: Rejections::default(),
        }
    }

    /// Fold a verdict; returns whether the loop advanced.
    fn apply(&mut self, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Accept(cycles) => {
                self.acc.record(cycles);
                self.completed += 1;
                true
            }
            Verdict::Failed => {
                self.failed += 1;
                self.completed += 1;
                true
            }
            Verdict::Retry(reason) => {
                self.rejected.record(reason);
                false
            }
        }
    }
}

/// Quiescence-filtered measurement loop on one core.
#[derive(Debug, Clone)]
pub struct Sampler<C, T> {
    clock: C,
    ticks: T,
    config: SamplerConfig,
}

impl<C: CycleClock, T: TickOracle> Sampler<C, T> {
    /// Create a sampler.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`SamplerConfig::validate`].
    pub fn new(clock: C, ticks: T, config: SamplerConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("{}", e);
        }
        Self {
            clock,
            ticks,
            config,
        }
    }

    /// The loop parameters.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// The clock samples are taken with.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The tick oracle windows are bracketed with.
    pub fn ticks(&self) -> &T {
        &self.ticks
    }

    /// One attempt: tick, window, optional settle delay, tick.
    #[inline]
    pub fn attempt<P: Probe<C> + ?Sized>(&self, probe: &mut P) -> Sample {
        probe.prepare();
        let tick_before = self.ticks.observe_tick();
        let window = probe.measure(&self.clock);
        if self.config.settle_cycles > 0 {
            self.clock.spin_for(self.config.settle_cycles);
        }
        let tick_after = self.ticks.observe_tick();
        Sample {
            window,
            tick_before,
            tick_after,
        }
    }

    /// Measure `op` until the target is reached (or the budget runs out).
    pub fn run<O: Operation>(&self, name: &str, op: O) -> SamplerReport {
        self.run_probe(name, &mut Timed(op))
    }

    /// Same loop for an arbitrary probe.
    pub fn run_probe<P: Probe<C> + ?Sized>(&self, name: &str, probe: &mut P) -> SamplerReport {
        for _ in 0..self.config.warmup {
            probe.prepare();
            probe.measure(&self.clock);
        }

        let mut tally = Tally::new(self.config.baseline);
        while tally.completed < self.config.samples as u64 && self.budget_left(&tally) {
            tally.attempts += 1;
            let sample = self.attempt(probe);
            let verdict = sample.validate(&self.config);
            if let Verdict::Retry(reason) = verdict {
                self.after_reject(name, reason, &sample);
            }
            tally.apply(verdict);
        }

        let iterations = tally.completed;
        self.finish(name, tally, self.config.baseline, iterations)
    }

    /// Measure a paired operation, keeping forward and reverse statistics apart.
    ///
    /// Each iteration measures the forward half and then the reverse half. A
    /// rejected forward sample whose operation succeeded is undone with an
    /// unmeasured reverse call before retrying. A forward failure counted
    /// under [`FailurePolicy::CountSeparately`] ends the iteration without a
    /// reverse, since there is nothing to undo. A rejected reverse sample
    /// retries the whole iteration, since the state is already restored.
    pub fn run_paired<P: PairedOperation>(
        &self,
        name: &str,
        reverse_baseline: u64,
        op: &mut P,
    ) -> PairedReport {
        for _ in 0..self.config.warmup {
            op.forward();
            op.reverse();
        }

        let mut fwd = Tally::new(self.config.baseline);
        let mut rev = Tally::new(reverse_baseline);
        let fwd_name = format!("{} forward", name);
        let rev_name = format!("{} reverse", name);

        let target = self.config.samples as u64;
        let mut iterations = 0u64;
        while iterations < target && self.budget_left(&fwd) {
            fwd.attempts += 1;
            let sample = self.attempt(&mut Timed(|| op.forward()));
            let verdict = sample.validate(&self.config);
            match verdict {
                Verdict::Retry(reason) => {
                    if sample.window.result == 0 {
                        op.reverse();
                    }
                    self.after_reject(&fwd_name, reason, &sample);
                    fwd.apply(verdict);
                    continue;
                }
                Verdict::Failed => {
                    fwd.apply(verdict);
                    iterations += 1;
                    continue;
                }
                Verdict::Accept(_) => {
                    fwd.apply(verdict);
                }
            }

            rev.attempts += 1;
            let sample = self.attempt(&mut Timed(|| op.reverse()));
            let verdict = sample.validate(&self.config);
            if let Verdict::Retry(reason) = verdict {
                self.after_reject(&rev_name, reason, &sample);
            }
            if rev.apply(verdict) {
                iterations += 1;
            }
        }

        PairedReport {
            forward: self.finish(&fwd_name, fwd, self.config.baseline, iterations),
            reverse: self.finish(&rev_name, rev, reverse_baseline, iterations),
        }
    }

    /// Naive average over `iterations` back-to-back calls, with no filtering.
    ///
    /// Returns `None` for zero iterations.
    pub fn run_unfiltered<O: Operation>(&self, mut op: O, iterations: usize) -> Option<f64> {
        if iterations == 0 {
            return None;
        }
        let start = self.clock.now();
        for _ in 0..iterations {
            op.invoke();
        }
        let end = self.clock.now();
        Some(end.saturating_sub(start) as f64 / iterations as f64)
    }

    fn budget_left(&self, tally: &Tally) -> bool {
        self.config
            .max_attempts
            .map_or(true, |max| tally.attempts < max as u64)
    }

    fn after_reject(&self, name: &str, reason: RejectReason, sample: &Sample) {
        match reason {
            RejectReason::TickChanged => {
                if self.config.quiescence_cycles > 0 {
                    self.clock.spin_for(self.config.quiescence_cycles);
                }
            }
            RejectReason::Outlier => {
                tracing::warn!(
                    "{}: possible firmware interruption, {} cycles discarded",
                    name,
                    sample.elapsed().unwrap_or(0)
                );
            }
            RejectReason::ClockAnomaly => {
                tracing::debug!(
                    "{}: end {} before start {}",
                    name,
                    sample.window.end,
                    sample.window.start
                );
            }
            RejectReason::Failed => {
                tracing::trace!("{}: operation returned {}", name, sample.window.result);
            }
        }
    }

    /// `iterations` is the loop progress shared by every report of the loop.
    fn finish(&self, name: &str, tally: Tally, baseline: u64, iterations: u64) -> SamplerReport {
        let mut warnings = Vec::new();

        let summary = match tally.acc.finalize() {
            Ok(summary) => {
                if let Some(drift) = summary.drift(self.config.drift_tolerance) {
                    tracing::warn!("{}: {}", name, drift);
                    warnings.push(Warning::BaselineDrift(drift));
                }
                Some(summary)
            }
            Err(_) => {
                tracing::warn!(
                    "{}: no sample accepted in {} attempts (baseline {})",
                    name,
                    tally.attempts,
                    baseline
                );
                warnings.push(Warning::NoAcceptedSamples);
                None
            }
        };

        let target = self.config.samples as u64;
        if iterations < target {
            tracing::warn!(
                "{}: attempt budget exhausted after {} of {} iterations",
                name,
                iterations,
                target
            );
            warnings.push(Warning::AttemptBudgetExhausted {
                completed: iterations,
                target,
            });
        }

        tracing::debug!(
            "{}: {} attempts, {} accepted, {} rejected",
            name,
            tally.attempts,
            tally.acc.count(),
            tally.rejected.total()
        );

        SamplerReport {
            name: name.to_string(),
            attempts: tally.attempts,
            completed: tally.completed,
            accepted: tally.acc.count(),
            failed: tally.failed,
            rejected: tally.rejected,
            summary,
            warnings,
        }
    }
}
