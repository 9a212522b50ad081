//! Multi-core run on the host: one pinned thread per logical core.
//!
//! Every core derives its role from its index, enters the start barrier with
//! all other participants and then runs that role until the primary cores
//! finish. The last primary to finish sets the completion flag; every other
//! role polls it at round boundaries and exits.
//!
//! Roles, for `P` primaries and signal offset `K`:
//! - `0..P` measure the configured workload.
//! - `c + K` answers round trips for primary `c` (round-trip workloads only).
//! - The first remaining core performs flushes (response workload only).
//! - All other cores interfere or idle, per [`Background`].

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::affinity::{allowed_cpus, available_cpus, AffinityGuard, Pinning};
use crate::barrier::CoreBarrier;
use crate::clock::{cycles_per_ns, CycleClock, Tsc};
use crate::completion::CompletionFlag;
use crate::config::{Background, RunConfig, Workload, DEFAULT_QUIESCENCE_CYCLES};
use crate::error::{Error, Result};
use crate::interference::{FlushHandshake, InterferenceStats, Interferer};
use crate::roundtrip::{Responder, RoundTripProbe};
use crate::sampler::{Pair, PairedReport, Probe, ResultCode, Sampler, SamplerReport, Window};
use crate::signal::SignalChannel;
use crate::tick::{ContextSwitchTick, DiagnosticSink, FlushPoint, SharedTick, TickOracle, TickSource};

/// Bytes per allocation unit of the allocation-based workloads.
pub const PAGE_SIZE: usize = 4096;

/// Allocation units per interference round.
pub const PAGES_PER_ROUND: usize = 1024;

/// What one core does during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum Role {
    /// Measures the workload.
    Primary,
    /// Answers round trips for `sender`.
    Receiver {
        /// Primary core served.
        sender: usize,
    },
    /// Emits a flush for every attempt of the primary.
    Flusher,
    /// Generates tick-gated background load.
    Interferer,
    /// Waits for completion.
    Idle,
}

impl Role {
    /// Role of `core` under `config`.
    pub fn assign(core: usize, config: &RunConfig) -> Role {
        if core < config.primaries {
            return Role::Primary;
        }
        if config.needs_receivers() {
            if let Some(sender) = core.checked_sub(config.signal_offset) {
                if sender < config.primaries {
                    return Role::Receiver { sender };
                }
            }
        }
        if config.workload == Workload::Response && Some(core) == first_free_core(config) {
            return Role::Flusher;
        }
        match config.background {
            Background::Interfere => Role::Interferer,
            Background::Idle => Role::Idle,
        }
    }
}

fn first_free_core(config: &RunConfig) -> Option<usize> {
    (config.primaries..config.cores).find(|&core| {
        !(config.needs_receivers()
            && core
                .checked_sub(config.signal_offset)
                .is_some_and(|sender| sender < config.primaries))
    })
}

/// Measurement produced by a primary core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum Measurement {
    /// A single operation.
    Single {
        /// Filtered statistics.
        report: SamplerReport,
        /// Naive average over the same number of calls, if requested.
        unfiltered: Option<f64>,
    },
    /// A forward/reverse pair.
    Paired {
        /// Filtered statistics for both halves.
        report: PairedReport,
    },
}

/// What a core produced by the end of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CoreOutcome {
    /// Primary result.
    Measured {
        /// The measurement.
        measurement: Measurement,
    },
    /// Round trips answered.
    Served {
        /// Requests answered.
        requests: u64,
    },
    /// Flushes performed.
    Flushed {
        /// Flush count.
        flushes: u64,
    },
    /// Interference counters.
    Interfered {
        /// Round counters.
        stats: InterferenceStats,
    },
    /// Nothing to report.
    Idle,
}

/// Result of one core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreReport {
    /// Logical core index.
    pub core: usize,
    /// Role the core played.
    pub role: Role,
    /// Whether the thread was pinned.
    pub pinned: bool,
    /// What it produced.
    pub outcome: CoreOutcome,
}

/// Result of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Configuration the run used.
    pub config: RunConfig,
    /// Cycle counter used for every timestamp.
    pub clock: String,
    /// Calibrated counter ticks per nanosecond.
    pub cycles_per_ns: f64,
    /// Emulated timer ticks fired.
    pub ticks_fired: u64,
    /// One entry per core, in core order.
    pub cores: Vec<CoreReport>,
}

impl RunReport {
    /// Reports of the primary cores, in core order.
    pub fn measurements(&self) -> impl Iterator<Item = (usize, &Measurement)> {
        self.cores.iter().filter_map(|c| match &c.outcome {
            CoreOutcome::Measured { measurement } => Some((c.core, measurement)),
            _ => None,
        })
    }
}

/// State every core of a run shares.
#[derive(Debug)]
pub struct SharedState {
    /// Start barrier.
    pub barrier: CoreBarrier,
    /// Round-trip slots, one per core.
    pub signals: SignalChannel,
    /// Set once every primary finished.
    pub done: Arc<CompletionFlag>,
    /// Primary/flusher lock-step.
    pub handshake: FlushHandshake,
    /// Emulated periodic timer.
    pub tick: SharedTick,
    primaries_left: AtomicUsize,
}

impl SharedState {
    /// Fresh state for `config.cores` participants.
    pub fn new(config: &RunConfig) -> Self {
        Self {
            barrier: CoreBarrier::new(),
            signals: SignalChannel::new(config.cores, config.cores),
            done: Arc::new(CompletionFlag::new()),
            handshake: FlushHandshake::new(),
            tick: SharedTick::new(),
            primaries_left: AtomicUsize::new(config.primaries),
        }
    }

    fn primary_finished(&self) {
        if self.primaries_left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.set();
        }
    }
}

/// Sink shared by every core.
pub type SharedSink = Arc<dyn DiagnosticSink + Send + Sync>;

/// Run `config` on host threads.
pub fn run(config: &RunConfig, sink: SharedSink) -> Result<RunReport> {
    config.validate()?;
    if config.cores > available_cpus() {
        tracing::warn!(
            "{} cores requested but only {} CPUs available; results will be noisy",
            config.cores,
            available_cpus()
        );
    }
    if !ContextSwitchTick::available() {
        tracing::warn!("per-thread context switches not observable; relying on the outlier ceiling");
    }

    let cpus = allowed_cpus();
    let state = SharedState::new(config);
    let source = (config.tick_period_us > 0).then(|| {
        TickSource::spawn(
            state.tick.clone(),
            Duration::from_micros(config.tick_period_us),
            state.done.clone(),
        )
    });

    let results: Vec<Result<CoreReport>> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.cores)
            .map(|core| {
                let state = &state;
                let sink = sink.clone();
                let cpu = pin_target(core, &cpus);
                s.spawn(move || run_core(core, cpu, config, state, sink))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(core, h)| h.join().unwrap_or(Err(Error::CorePanicked { core })))
            .collect()
    });

    // A failed primary still released its siblings; make sure the source stops.
    state.done.set();
    let ticks_fired = source.map_or(0, TickSource::join);

    let cores = results.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(RunReport {
        config: config.clone(),
        clock: Tsc.name().to_string(),
        cycles_per_ns: cycles_per_ns(),
        ticks_fired,
        cores,
    })
}

/// CPU for `core`: the `core`-th allowed CPU, wrapping when oversubscribed.
fn pin_target(core: usize, cpus: &[usize]) -> usize {
    if cpus.is_empty() {
        return core;
    }
    cpus[core % cpus.len()]
}

fn run_core(
    core: usize,
    cpu: usize,
    config: &RunConfig,
    state: &SharedState,
    sink: SharedSink,
) -> Result<CoreReport> {
    let role = Role::assign(core, config);
    let pinning = if config.pin_cores {
        AffinityGuard::pin_to(cpu)
    } else {
        Pinning::NotPinned {
            reason: "pinning disabled".to_string(),
        }
    };
    if let Pinning::NotPinned { reason } = &pinning {
        if config.pin_cores {
            tracing::warn!("core {}: not pinned to CPU {}: {}", core, cpu, reason);
        }
    }

    let outcome = match role {
        Role::Primary => {
            state.barrier.enter(config.cores);
            let measured = measure(core, config, state, &sink);
            state.primary_finished();
            CoreOutcome::Measured {
                measurement: measured?,
            }
        }
        Role::Receiver { sender } => {
            let responder =
                Responder::bind(&state.signals, sender, config.signal_offset, Tsc, config.payload)?;
            state.barrier.enter(config.cores);
            CoreOutcome::Served {
                requests: responder.serve(&state.done),
            }
        }
        Role::Flusher => {
            state.barrier.enter(config.cores);
            let marker = config.flush_marker.as_deref().unwrap_or("FLUSH!!");
            CoreOutcome::Flushed {
                flushes: state.handshake.serve(&state.done, || sink.emit(marker)),
            }
        }
        Role::Interferer => {
            state.barrier.enter(config.cores);
            let lock_step = config.workload == Workload::Response;
            CoreOutcome::Interfered {
                stats: interfere(state, config, lock_step),
            }
        }
        Role::Idle => {
            state.barrier.enter(config.cores);
            state.done.wait();
            CoreOutcome::Idle
        }
    };

    tracing::debug!("core {} ({:?}) done", core, role);
    Ok(CoreReport {
        core,
        role,
        pinned: pinning.is_pinned(),
        outcome,
    })
}

/// Oracle used by primaries: emulated timer plus descheduling of this thread.
type HostTick<'a> = FlushPoint<&'a SharedSink, (ContextSwitchTick, SharedTick)>;

fn host_tick<'a>(config: &RunConfig, state: &SharedState, sink: &'a SharedSink) -> HostTick<'a> {
    let point = FlushPoint::new(sink, (ContextSwitchTick, state.tick.clone()));
    match &config.flush_marker {
        Some(marker) => point.with_marker(marker.clone()),
        None => point,
    }
}

fn measure(
    core: usize,
    config: &RunConfig,
    state: &SharedState,
    sink: &SharedSink,
) -> Result<Measurement> {
    let sampler = Sampler::new(Tsc, host_tick(config, state, sink), config.sampler.clone());
    let name = format!("core {}", core);

    let measurement = match config.workload {
        Workload::Null => single(&sampler, config, &format!("{} null", name), || 0),
        Workload::Spin { iterations } => {
            single(&sampler, config, &format!("{} spin", name), move || spin(iterations))
        }
        Workload::RoundTrip => {
            let mut probe =
                RoundTripProbe::connect(&state.signals, core, config.signal_offset, config.payload)?;
            Measurement::Single {
                report: sampler.run_probe(&format!("{} round trip", name), &mut probe),
                unfiltered: None,
            }
        }
        Workload::Response => {
            let inner =
                RoundTripProbe::connect(&state.signals, core, config.signal_offset, config.payload)?;
            let mut probe = FlushedProbe {
                inner,
                handshake: &state.handshake,
            };
            Measurement::Single {
                report: sampler.run_probe(&format!("{} response", name), &mut probe),
                unfiltered: None,
            }
        }
        Workload::AllocFree => {
            let page = std::cell::RefCell::new(None::<Vec<u8>>);
            let mut op = Pair {
                forward: || alloc_page(&mut page.borrow_mut()),
                reverse: || free_page(&mut page.borrow_mut()),
            };
            Measurement::Paired {
                report: sampler.run_paired(&format!("{} alloc", name), config.reverse_baseline, &mut op),
            }
        }
    };
    Ok(measurement)
}

fn single<C, T, F>(sampler: &Sampler<C, T>, config: &RunConfig, name: &str, mut op: F) -> Measurement
where
    C: CycleClock,
    T: TickOracle,
    F: FnMut() -> ResultCode,
{
    let report = sampler.run(name, &mut op);
    let unfiltered = if config.unfiltered {
        sampler.run_unfiltered(&mut op, config.sampler.samples)
    } else {
        None
    };
    Measurement::Single { report, unfiltered }
}

#[inline(never)]
fn spin(iterations: u32) -> ResultCode {
    for i in 0..iterations {
        black_box(i);
    }
    0
}

fn alloc_page(slot: &mut Option<Vec<u8>>) -> ResultCode {
    if slot.is_some() {
        return -1;
    }
    let mut page = vec![0u8; PAGE_SIZE];
    page[0] = 1;
    *slot = Some(black_box(page));
    0
}

fn free_page(slot: &mut Option<Vec<u8>>) -> ResultCode {
    match slot.take() {
        Some(page) => {
            drop(black_box(page));
            0
        }
        None => -1,
    }
}

/// Round-trip probe that waits for a flush before every attempt.
struct FlushedProbe<'a> {
    inner: RoundTripProbe<'a>,
    handshake: &'a FlushHandshake,
}

impl<C: CycleClock + ?Sized> Probe<C> for FlushedProbe<'_> {
    fn prepare(&mut self) {
        Probe::<C>::prepare(&mut self.inner);
        self.handshake.request();
    }

    fn measure(&mut self, clock: &C) -> Window {
        self.inner.measure(clock)
    }
}

fn interfere(state: &SharedState, config: &RunConfig, lock_step: bool) -> InterferenceStats {
    let quiescence = match config.sampler.quiescence_cycles {
        0 => DEFAULT_QUIESCENCE_CYCLES,
        q => q,
    };
    let interferer = Interferer::new(Tsc, state.tick.clone(), quiescence);
    let mut seen = state.handshake.completed();
    let mut pages: Vec<Vec<u8>> = Vec::with_capacity(PAGES_PER_ROUND);

    interferer.run(&state.done, || {
        for _ in 0..PAGES_PER_ROUND {
            if lock_step {
                match state.handshake.follow(seen, &state.done) {
                    Some(acked) => seen = acked,
                    None => break,
                }
            }
            let mut page = vec![0u8; PAGE_SIZE];
            page[PAGE_SIZE - 1] = 1;
            pages.push(black_box(page));
        }
        pages.clear();
        0
    })
}
