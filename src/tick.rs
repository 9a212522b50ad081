//! Epoch tick oracle and diagnostic sink.
//!
//! A tick is a coarse counter that advances exactly when the observing core
//! serviced a periodic timer interrupt (or, on a hosted OS, was descheduled).
//! Two observations bracketing a measurement window that differ mean the
//! window was contaminated and the sample must be retried.
//!
//! The diagnostic text sink and the tick oracle are separate capabilities.
//! [`FlushPoint`] invokes both at the same call site so the tick read happens
//! at the point the diagnostic text is flushed:
//!
//! ```ignore
//! use tickgate::tick::{FlushPoint, SharedTick, StdoutSink};
//!
//! let flush = FlushPoint::new(StdoutSink, SharedTick::new()).with_marker("FLUSH!!");
//! let tick = flush.flush();
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::completion::CompletionFlag;

/// Interrupt epoch counter value.
pub type Tick = u32;

/// Source of the current tick on the calling core.
pub trait TickOracle {
    /// Observe the current tick. May have side effects (diagnostic output).
    fn observe_tick(&self) -> Tick;
}

impl<T: TickOracle + ?Sized> TickOracle for &T {
    #[inline]
    fn observe_tick(&self) -> Tick {
        (**self).observe_tick()
    }
}

impl<T: TickOracle + ?Sized> TickOracle for Arc<T> {
    #[inline]
    fn observe_tick(&self) -> Tick {
        (**self).observe_tick()
    }
}

/// Two oracles observed together: the tick changes when either changes.
impl<A: TickOracle, B: TickOracle> TickOracle for (A, B) {
    #[inline]
    fn observe_tick(&self) -> Tick {
        self.0.observe_tick().wrapping_add(self.1.observe_tick())
    }
}

// =============================================================================
// Tick sources
// =============================================================================

/// Tick derived from the calling thread's context-switch count.
///
/// On Linux this reads `getrusage(RUSAGE_THREAD)` and sums voluntary and
/// involuntary switches, so the value advances whenever the thread lost the
/// CPU mid-window. Interrupts serviced without a context switch are not
/// visible here; the sampler's outlier ceiling covers those.
///
/// On other platforms the tick is constant and filtering relies on the
/// outlier ceiling alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSwitchTick;

impl ContextSwitchTick {
    /// Check that the platform reports per-thread context switches.
    pub fn available() -> bool {
        #[cfg(target_os = "linux")]
        {
            read_rusage_switches().is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}

impl TickOracle for ContextSwitchTick {
    #[inline]
    fn observe_tick(&self) -> Tick {
        #[cfg(target_os = "linux")]
        {
            read_rusage_switches().unwrap_or(0) as Tick
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}

#[cfg(target_os = "linux")]
fn read_rusage_switches() -> Option<u64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided rusage struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: getrusage succeeded and initialised the struct.
    let usage = unsafe { usage.assume_init() };
    Some((usage.ru_nvcsw as u64).wrapping_add(usage.ru_nivcsw as u64))
}

/// A tick shared through an atomic cell.
///
/// Cloning yields another handle to the same counter. Tests and simulations
/// advance it by hand; [`TickSource`] advances it periodically.
#[derive(Debug, Clone, Default)]
pub struct SharedTick {
    value: Arc<AtomicU32>,
}

impl SharedTick {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one, as if a timer interrupt had been serviced.
    pub fn advance(&self) -> Tick {
        self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Current value without side effects.
    pub fn get(&self) -> Tick {
        self.value.load(Ordering::Acquire)
    }
}

impl TickOracle for SharedTick {
    #[inline]
    fn observe_tick(&self) -> Tick {
        self.value.load(Ordering::Acquire)
    }
}

/// Background thread emulating a periodic timer interrupt.
///
/// Advances a [`SharedTick`] every `period` until the completion flag is set.
#[derive(Debug)]
pub struct TickSource {
    handle: JoinHandle<u64>,
}

impl TickSource {
    /// Start ticking `tick` every `period`.
    pub fn spawn(tick: SharedTick, period: Duration, done: Arc<CompletionFlag>) -> Self {
        let handle = thread::spawn(move || {
            let mut fired = 0u64;
            while !done.is_set() {
                thread::sleep(period);
                tick.advance();
                fired += 1;
            }
            fired
        });
        Self { handle }
    }

    /// Wait for the thread to observe completion; returns ticks fired.
    pub fn join(self) -> u64 {
        self.handle.join().unwrap_or(0)
    }
}

// =============================================================================
// Diagnostic sinks
// =============================================================================

/// Destination for human-readable progress and result text.
pub trait DiagnosticSink {
    /// Emit one line of text.
    fn emit(&self, text: &str);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &S {
    fn emit(&self, text: &str) {
        (**self).emit(text)
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn emit(&self, text: &str) {
        (**self).emit(text)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _text: &str) {}
}

/// Writes each line to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn emit(&self, text: &str) {
        println!("{}", text);
    }
}

/// Forwards each line to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, text: &str) {
        tracing::debug!(target: "tickgate::diag", "{}", text);
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for BufferSink {
    fn emit(&self, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(text.to_string());
        }
    }
}

// =============================================================================
// Flush point
// =============================================================================

/// A diagnostic sink and a tick oracle invoked together.
///
/// With a marker configured, every observation first emits the marker to the
/// sink and then reads the tick, reproducing a fixed, repeatable flush point
/// at both ends of a measurement window.
#[derive(Debug, Clone)]
pub struct FlushPoint<S, T> {
    sink: S,
    oracle: T,
    marker: Option<String>,
}

impl<S: DiagnosticSink, T: TickOracle> FlushPoint<S, T> {
    /// Pair a sink with an oracle. No marker is emitted until one is set.
    pub fn new(sink: S, oracle: T) -> Self {
        Self {
            sink,
            oracle,
            marker: None,
        }
    }

    /// Emit `marker` at every observation.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Emit the marker (if any) and return the tick observed right after.
    #[inline]
    pub fn flush(&self) -> Tick {
        if let Some(marker) = &self.marker {
            self.sink.emit(marker);
        }
        self.oracle.observe_tick()
    }

    /// Emit report text without observing the tick.
    pub fn report(&self, text: &str) {
        self.sink.emit(text);
    }

    /// The underlying sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The underlying oracle.
    pub fn oracle(&self) -> &T {
        &self.oracle
    }
}

impl<S: DiagnosticSink, T: TickOracle> TickOracle for FlushPoint<S, T> {
    #[inline]
    fn observe_tick(&self) -> Tick {
        self.flush()
    }
}

/// Observe until the tick changes, returning the new value.
///
/// This is the tick-driven rendezvous: every core that waits for the same
/// edge resumes right after the same interrupt.
pub fn wait_for_tick_edge<T: TickOracle + ?Sized>(oracle: &T) -> Tick {
    let first = oracle.observe_tick();
    loop {
        let now = oracle.observe_tick();
        if now != first {
            return now;
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_tick_handles_share_one_counter() {
        let a = SharedTick::new();
        let b = a.clone();
        assert_eq!(b.observe_tick(), 0);
        a.advance();
        a.advance();
        assert_eq!(b.observe_tick(), 2);
    }

    #[test]
    fn flush_point_emits_marker_before_each_observation() {
        let sink = BufferSink::new();
        let tick = SharedTick::new();
        let flush = FlushPoint::new(&sink, tick.clone()).with_marker("FLUSH!!");

        assert_eq!(flush.flush(), 0);
        tick.advance();
        assert_eq!(flush.observe_tick(), 1);
        assert_eq!(sink.lines(), vec!["FLUSH!!", "FLUSH!!"]);
    }

    #[test]
    fn flush_point_without_marker_is_silent() {
        let sink = BufferSink::new();
        let flush = FlushPoint::new(&sink, SharedTick::new());
        flush.flush();
        flush.report("done");
        assert_eq!(sink.lines(), vec!["done"]);
    }

    #[test]
    fn paired_oracles_change_when_either_changes() {
        let a = SharedTick::new();
        let b = SharedTick::new();
        let both = (a.clone(), b.clone());
        let t0 = both.observe_tick();
        b.advance();
        assert_ne!(both.observe_tick(), t0);
    }

    #[test]
    fn tick_edge_returns_after_advance() {
        let tick = SharedTick::new();
        let ticker = tick.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            ticker.advance();
        });
        assert_eq!(wait_for_tick_edge(&tick), 1);
        handle.join().unwrap();
    }

    #[test]
    fn tick_source_stops_on_completion() {
        let done = Arc::new(CompletionFlag::new());
        let tick = SharedTick::new();
        let source = TickSource::spawn(tick.clone(), Duration::from_millis(1), done.clone());
        wait_for_tick_edge(&tick);
        done.set();
        assert!(source.join() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn context_switch_tick_advances_after_yield() {
        assert!(ContextSwitchTick::available());
        let oracle = ContextSwitchTick;
        let before = oracle.observe_tick();
        thread::sleep(Duration::from_millis(1));
        assert_ne!(oracle.observe_tick(), before);
    }
}
