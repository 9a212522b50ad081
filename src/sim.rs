//! Deterministic clock and operations for exercising the sampler off-target.
//!
//! [`SimClock`] is a counter that only moves when told to. [`SyntheticOp`]
//! charges a fixed cost to it and, with a configurable probability, advances a
//! [`SharedTick`] mid-operation to emulate a timer interrupt landing inside
//! the measurement window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::clock::{CycleClock, CycleTimestamp};
use crate::sampler::{Operation, ResultCode};
use crate::tick::SharedTick;

/// Manually advanced cycle counter. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    /// A clock at cycle zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `cycles` to the clock.
    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::AcqRel);
    }

    /// Jump to an absolute value (may move backwards).
    pub fn set(&self, value: CycleTimestamp) {
        self.now.store(value, Ordering::Release);
    }

    /// Current value.
    pub fn get(&self) -> CycleTimestamp {
        self.now.load(Ordering::Acquire)
    }
}

impl CycleClock for SimClock {
    fn now(&self) -> CycleTimestamp {
        self.get()
    }

    fn spin_for(&self, cycles: u64) {
        self.advance(cycles);
    }
}

/// Operation with a fixed cost and random tick interference.
#[derive(Debug)]
pub struct SyntheticOp {
    clock: SimClock,
    tick: SharedTick,
    cost: u64,
    flip_probability: f64,
    rng: Xoshiro256PlusPlus,
    flips: u64,
    result: ResultCode,
}

impl SyntheticOp {
    /// An operation costing `cost` cycles that never disturbs the tick.
    pub fn new(clock: SimClock, tick: SharedTick, cost: u64) -> Self {
        Self {
            clock,
            tick,
            cost,
            flip_probability: 0.0,
            rng: Xoshiro256PlusPlus::seed_from_u64(0),
            flips: 0,
            result: 0,
        }
    }

    /// Advance the tick mid-operation with `probability` per call.
    ///
    /// # Panics
    ///
    /// Panics unless `probability` is within `0.0..=1.0`.
    pub fn flip_probability(mut self, probability: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&probability),
            "flip_probability must be within 0..=1"
        );
        self.flip_probability = probability;
        self
    }

    /// Reseed the interference generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self
    }

    /// Return `code` from every call.
    pub fn result(mut self, code: ResultCode) -> Self {
        self.result = code;
        self
    }

    /// Ticks injected so far.
    pub fn flips(&self) -> u64 {
        self.flips
    }
}

impl Operation for SyntheticOp {
    fn invoke(&mut self) -> ResultCode {
        if self.flip_probability > 0.0 && self.rng.random_bool(self.flip_probability) {
            self.tick.advance();
            self.flips += 1;
        }
        self.clock.advance(self.cost);
        self.result
    }
}

/// An operation that always returns `-1` without consuming cycles.
pub fn always_failing() -> impl FnMut() -> ResultCode {
    || -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_for_advances_sim_clock() {
        let clock = SimClock::new();
        clock.spin_for(100);
        assert_eq!(clock.now(), 100);
    }

    #[test]
    fn synthetic_op_is_deterministic_per_seed() {
        let run = |seed| {
            let mut op = SyntheticOp::new(SimClock::new(), SharedTick::new(), 10)
                .flip_probability(0.5)
                .seed(seed);
            for _ in 0..1000 {
                op.invoke();
            }
            op.flips()
        };
        assert_eq!(run(7), run(7));
        let flips = run(7);
        assert!(flips > 400 && flips < 600, "flips = {}", flips);
    }

    #[test]
    fn synthetic_op_charges_cost() {
        let clock = SimClock::new();
        let mut op = SyntheticOp::new(clock.clone(), SharedTick::new(), 500);
        op.invoke();
        op.invoke();
        assert_eq!(clock.get(), 1000);
    }
}
