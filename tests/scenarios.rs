//! End-to-end sampler scenarios on a simulated clock.

use tickgate::sim::{always_failing, SimClock, SyntheticOp};
use tickgate::{
    Error, FailurePolicy, Operation, Sampler, SamplerConfig, SharedTick, Warning,
};

// =============================================================================
// RARE INTERRUPTS
// =============================================================================

#[test]
fn rare_ticks_are_filtered_exactly() {
    const ATTEMPTS: usize = 1 << 20;

    let clock = SimClock::new();
    let tick = SharedTick::new();
    let mut op = SyntheticOp::new(clock.clone(), tick.clone(), 500)
        .flip_probability(0.00001)
        .seed(0x5eed);

    let config = SamplerConfig::new()
        .samples(ATTEMPTS)
        .max_attempts(ATTEMPTS)
        .baseline(500);
    let sampler = Sampler::new(&clock, &tick, config);
    let report = sampler.run("synthetic", || op.invoke());

    assert_eq!(report.attempts, ATTEMPTS as u64);
    assert_eq!(report.rejected.tick_changed, op.flips());
    assert_eq!(report.accepted, ATTEMPTS as u64 - op.flips());
    assert_eq!(report.rejected.total(), report.rejected.tick_changed);

    let summary = report.summary().unwrap();
    assert_eq!(summary.mean, 500.0);
    assert_eq!(summary.max, 500);
    assert_eq!(summary.variance, 0.0);
    assert!(!report.warnings.contains(&Warning::NoAcceptedSamples));
    assert!(!report.drifted());
}

#[test]
fn unbounded_run_reaches_target_despite_ticks() {
    let clock = SimClock::new();
    let tick = SharedTick::new();
    let mut op = SyntheticOp::new(clock.clone(), tick.clone(), 120)
        .flip_probability(0.2)
        .seed(3);

    let config = SamplerConfig::new()
        .samples(10_000)
        .baseline(120)
        .quiescence_cycles(10_000);
    let sampler = Sampler::new(&clock, &tick, config);
    let report = sampler.run("noisy", || op.invoke());

    assert_eq!(report.accepted, 10_000);
    assert_eq!(report.attempts, 10_000 + op.flips());
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.summary().unwrap().max, 120);
}

// =============================================================================
// FAILING OPERATIONS
// =============================================================================

#[test]
fn always_failing_operation_never_divides_by_zero() {
    const ATTEMPTS: usize = 1 << 16;

    let clock = SimClock::new();
    let tick = SharedTick::new();
    let config = SamplerConfig::new()
        .samples(ATTEMPTS)
        .max_attempts(ATTEMPTS)
        .failure_policy(FailurePolicy::Retry);
    let sampler = Sampler::new(&clock, &tick, config);
    let report = sampler.run("broken", always_failing());

    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected.failed, ATTEMPTS as u64);
    assert!(report.summary.is_none());
    assert!(matches!(report.summary(), Err(Error::NoAcceptedSamples)));
    assert!(report.warnings.contains(&Warning::NoAcceptedSamples));
}

#[test]
fn default_config_never_accepts_failed_operations() {
    let clock = SimClock::new();
    let tick = SharedTick::new();
    let config = SamplerConfig::new().samples(100).max_attempts(100);
    let sampler = Sampler::new(&clock, &tick, config);
    let report = sampler.run("broken", always_failing());

    assert_eq!(report.accepted, 0);
    assert_eq!(report.failed, 100);
    assert!(matches!(report.summary(), Err(Error::NoAcceptedSamples)));
    assert!(report.warnings.contains(&Warning::NoAcceptedSamples));
}

#[test]
fn failures_counted_separately_complete_the_loop() {
    let clock = SimClock::new();
    let tick = SharedTick::new();
    let config = SamplerConfig::cap_activate().samples(64).settle_cycles(0);
    let sampler = Sampler::new(&clock, &tick, config);
    let report = sampler.run("deny", always_failing());

    assert_eq!(report.completed, 64);
    assert_eq!(report.failed, 64);
    assert_eq!(report.accepted, 0);
    assert!(report.warnings.contains(&Warning::NoAcceptedSamples));
    assert!(!report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::AttemptBudgetExhausted { .. })));
}

// =============================================================================
// CLOCK ANOMALIES AND OUTLIERS
// =============================================================================

#[test]
fn backwards_clock_and_outliers_are_retried() {
    let clock = SimClock::new();
    let tick = SharedTick::new();
    let mut n = 0u32;
    let config = SamplerConfig::new().samples(100).outlier_ceiling(1_000);
    let sampler = Sampler::new(&clock, &tick, config);

    let report = sampler.run("glitchy", || {
        n += 1;
        match n % 10 {
            // Counter reset mid-window.
            3 => clock.set(0),
            // Firmware interruption.
            7 => clock.advance(50_000),
            _ => clock.advance(300),
        }
        0
    });

    assert_eq!(report.accepted, 100);
    assert!(report.rejected.clock_anomaly > 0);
    assert!(report.rejected.outlier > 0);
    assert_eq!(report.summary().unwrap().max, 300);
}
