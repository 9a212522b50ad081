//! Multi-threaded tests of the cross-core primitives and the host runner.

use std::sync::Arc;
use std::thread;

use tickgate::harness::{self, SharedSink};
use tickgate::{
    Background, BufferSink, CompletionFlag, CoreBarrier, CoreOutcome, Measurement, NullSink,
    RunConfig, SamplerConfig, SignalChannel, Workload,
};

// =============================================================================
// BARRIER + SIGNAL SLOTS
// =============================================================================

/// Token passed around a ring of cores, one barrier round per hop.
#[test]
fn token_ring_over_signal_slots() {
    const CORES: usize = 6;
    const LAPS: u64 = 20;

    let barrier = Arc::new(CoreBarrier::new());
    let channel = Arc::new(SignalChannel::new(CORES, CORES));

    let handles: Vec<_> = (0..CORES)
        .map(|core| {
            let barrier = barrier.clone();
            let channel = channel.clone();
            thread::spawn(move || {
                let mine = channel.slot(core).unwrap();
                let next = channel.slot((core + 1) % CORES).unwrap();
                mine.reset();
                barrier.enter(CORES);

                let mut seen = Vec::new();
                for lap in 0..LAPS {
                    if core == 0 {
                        next.post_value(lap * CORES as u64 + 1).unwrap();
                        seen.push(mine.wait().get());
                        mine.reset();
                    } else {
                        let token = mine.wait().get();
                        mine.reset();
                        next.post_value(token + 1).unwrap();
                        seen.push(token);
                    }
                    barrier.enter(CORES);
                }
                seen
            })
        })
        .collect();

    for (core, h) in handles.into_iter().enumerate() {
        let seen = h.join().unwrap();
        for (lap, token) in seen.into_iter().enumerate() {
            let base = lap as u64 * CORES as u64 + 1;
            let expected = if core == 0 { base + CORES as u64 - 1 } else { base + core as u64 - 1 };
            assert_eq!(token, expected, "core {} lap {}", core, lap);
        }
    }
    assert_eq!(barrier.rounds_completed(CORES), LAPS + 1);
}

#[test]
fn completion_flag_releases_every_role() {
    let done = Arc::new(CompletionFlag::new());
    let barrier = Arc::new(CoreBarrier::new());
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let (done, barrier) = (done.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.enter(5);
                done.wait();
            })
        })
        .collect();
    barrier.enter(5);
    assert!(done.set());
    for w in waiters {
        w.join().unwrap();
    }
}

// =============================================================================
// HOST RUNS
// =============================================================================

fn quiet() -> SharedSink {
    Arc::new(NullSink)
}

/// Spinning roles need a CPU each, or every window sees a context switch.
fn enough_cpus(cores: usize) -> bool {
    let available = tickgate::affinity::available_cpus();
    if available < cores {
        eprintln!("skipped: {} cores needed, {} available", cores, available);
    }
    available >= cores
}

#[test]
fn round_trip_under_interference() {
    let config = RunConfig::new()
        .cores(4)
        .workload(Workload::RoundTrip)
        .background(Background::Interfere)
        .sampler(SamplerConfig::ipi().samples(500))
        .pin_cores(false);
    if !enough_cpus(config.cores) {
        return;
    }
    let report = harness::run(&config, quiet()).unwrap();

    let (_, measurement) = report.measurements().next().unwrap();
    let Measurement::Single { report: loop_report, .. } = measurement else {
        panic!("expected a single measurement");
    };
    assert_eq!(loop_report.completed, 500);
    assert!(loop_report.summary().is_ok());
    assert!(loop_report.summary().unwrap().max <= tickgate::config::CROSS_CORE_OUTLIER_CEILING);

    for core in &report.cores[2..] {
        assert!(matches!(core.outcome, CoreOutcome::Interfered { .. }));
    }
}

#[test]
fn two_primaries_each_get_a_receiver() {
    let config = RunConfig::new()
        .cores(4)
        .primaries(2)
        .signal_offset(2)
        .workload(Workload::RoundTrip)
        .sampler(SamplerConfig::new().samples(100))
        .pin_cores(false);
    if !enough_cpus(config.cores) {
        return;
    }
    let report = harness::run(&config, quiet()).unwrap();

    assert_eq!(report.measurements().count(), 2);
    for core in &report.cores[2..] {
        assert!(matches!(core.outcome, CoreOutcome::Served { requests } if requests >= 100));
    }
}

#[test]
fn flush_marker_reaches_the_sink() {
    let sink = Arc::new(BufferSink::new());
    let config = RunConfig::new()
        .cores(1)
        .workload(Workload::Spin { iterations: 10 })
        .sampler(SamplerConfig::new().samples(5))
        .flush_marker("FLUSH!!")
        .pin_cores(false);
    let shared: SharedSink = sink.clone();
    let report = harness::run(&config, shared).unwrap();

    let (_, Measurement::Single { report: loop_report, .. }) = report.measurements().next().unwrap() else {
        panic!("expected a single measurement");
    };
    // Two flush points per attempt.
    assert_eq!(sink.lines().len() as u64, 2 * loop_report.attempts);
}

#[test]
fn saved_config_loads_back() {
    let dir = std::env::temp_dir().join(format!("tickgate-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("run.json");

    let config = RunConfig::new().cores(3).workload(Workload::RoundTrip);
    std::fs::write(&path, config.to_json().unwrap()).unwrap();
    assert_eq!(RunConfig::from_json_file(&path).unwrap(), config);

    std::fs::remove_dir_all(&dir).unwrap();
}
