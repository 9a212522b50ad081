//! Core-local cycle counter.
//!
//! The counter must be cheap (single-digit to low double-digit cycles) and
//! serialising, so the instructions of the measured operation cannot drift
//! across a timestamp:
//! - **x86_64**: `lfence; rdtscp; lfence`
//! - **aarch64**: `isb; mrs cntvct_el0`
//! - **other**: nanoseconds since a process-wide `Instant` (coarse fallback)
//!
//! Timestamps are only comparable on the core that took them. Comparing raw
//! values across cores needs an invariant, synchronised counter and is the
//! reason the sampler treats `end < start` as a clock anomaly.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Count of processor cycles since an arbitrary per-core epoch.
pub type CycleTimestamp = u64;

/// Source of monotonic, core-local cycle timestamps.
pub trait CycleClock {
    /// Read the counter. Acts as an ordering barrier for surrounding code.
    fn now(&self) -> CycleTimestamp;

    /// Busy-wait until at least `cycles` cycles have elapsed.
    ///
    /// Used to ride out the tail of an interrupt or a kernel quiescence
    /// period. Never yields to the scheduler.
    fn spin_for(&self, cycles: u64) {
        let start = self.now();
        while self.now().wrapping_sub(start) <= cycles {
            core::hint::spin_loop();
        }
    }
}

impl<C: CycleClock + ?Sized> CycleClock for &C {
    #[inline(always)]
    fn now(&self) -> CycleTimestamp {
        (**self).now()
    }

    fn spin_for(&self, cycles: u64) {
        (**self).spin_for(cycles)
    }
}

impl<C: CycleClock + ?Sized> CycleClock for Arc<C> {
    #[inline(always)]
    fn now(&self) -> CycleTimestamp {
        (**self).now()
    }

    fn spin_for(&self, cycles: u64) {
        (**self).spin_for(cycles)
    }
}

/// The hardware cycle counter of the current core.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tsc;

impl Tsc {
    /// Counter name for report metadata.
    pub fn name(&self) -> &'static str {
        #[cfg(target_arch = "x86_64")]
        {
            "rdtscp"
        }
        #[cfg(target_arch = "aarch64")]
        {
            "cntvct_el0"
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            "Instant"
        }
    }
}

impl CycleClock for Tsc {
    #[inline(always)]
    fn now(&self) -> CycleTimestamp {
        read_counter()
    }
}

/// Serialising read of the platform cycle counter.
#[inline(always)]
pub fn read_counter() -> CycleTimestamp {
    #[cfg(target_arch = "x86_64")]
    {
        use core::arch::x86_64::{__rdtscp, _mm_lfence};

        let mut aux = 0u32;
        // SAFETY: lfence is part of SSE2, which every x86_64 CPU implements;
        // rdtscp only writes the processor id into `aux`.
        unsafe {
            _mm_lfence();
            let t = __rdtscp(&mut aux);
            _mm_lfence();
            t
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        let t: u64;
        // SAFETY: cntvct_el0 is readable from EL0 on every supported OS.
        unsafe {
            core::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) t, options(nostack));
        }
        t
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Calibrated counter ticks per nanosecond (cached after the first call).
///
/// Takes the median of a few short sleeps against `Instant`. Only used to
/// annotate reports; every measurement stays in raw cycles.
pub fn cycles_per_ns() -> f64 {
    static RATIO: OnceLock<f64> = OnceLock::new();

    *RATIO.get_or_init(|| {
        const SAMPLES: usize = 5;
        const SLEEP: Duration = Duration::from_millis(10);

        let mut ratios = Vec::with_capacity(SAMPLES);
        for _ in 0..SAMPLES {
            let start_cycles = read_counter();
            let start = Instant::now();
            std::thread::sleep(SLEEP);
            let cycles = read_counter().wrapping_sub(start_cycles);
            let ns = start.elapsed().as_nanos() as f64;
            if ns > 0.0 && cycles > 0 {
                ratios.push(cycles as f64 / ns);
            }
        }

        if ratios.is_empty() {
            tracing::warn!("cycle counter calibration failed, assuming 1 cycle/ns");
            return 1.0;
        }

        ratios.sort_by(|a, b| a.total_cmp(b));
        let median = ratios[ratios.len() / 2];
        tracing::debug!("cycle counter calibrated to {:.3} cycles/ns", median);
        median
    })
}
