//! Background load on non-primary cores.
//!
//! An [`Interferer`] runs rounds of work (typically allocation followed by
//! release), then rendezvous on the next tick edge and busy-waits for the
//! quiescence period. All interferers therefore resume right after the same
//! interrupt, which makes the contention seen by the primary core repeatable.
//! The completion flag is checked only at round boundaries.
//!
//! [`FlushHandshake`] keeps the primary core and a designated flusher in
//! lock-step: before every attempt the primary requests a flush and waits
//! until the flusher has emitted it. Interferers may follow the same sequence
//! to pace their work units with the primary's attempts.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::clock::CycleClock;
use crate::completion::CompletionFlag;
use crate::sampler::ResultCode;
use crate::tick::{Tick, TickOracle};

/// Counters reported by an interferer when the run completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterferenceStats {
    /// Rounds finished.
    pub rounds: u64,
    /// Rounds whose work returned a non-zero code.
    pub failures: u64,
}

/// Tick-gated background work loop.
#[derive(Debug, Clone)]
pub struct Interferer<C, T> {
    clock: C,
    ticks: T,
    quiescence_cycles: u64,
}

impl<C: CycleClock, T: TickOracle> Interferer<C, T> {
    /// An interferer that waits `quiescence_cycles` after every tick edge.
    pub fn new(clock: C, ticks: T, quiescence_cycles: u64) -> Self {
        Self {
            clock,
            ticks,
            quiescence_cycles,
        }
    }

    /// Run `round` repeatedly until `done` is set.
    ///
    /// A round returning non-zero aborted early. It is logged and counted and
    /// the loop keeps going.
    pub fn run<W>(&self, done: &CompletionFlag, mut round: W) -> InterferenceStats
    where
        W: FnMut() -> ResultCode,
    {
        let mut stats = InterferenceStats::default();
        while !done.is_set() {
            let rc = round();
            if rc != 0 {
                stats.failures += 1;
                tracing::warn!("interference round {} failed with {}", stats.rounds, rc);
            }
            stats.rounds += 1;

            if wait_for_tick_edge_or(&self.ticks, done).is_none() {
                break;
            }
            if self.quiescence_cycles > 0 {
                self.clock.spin_for(self.quiescence_cycles);
            }
        }
        tracing::debug!(
            "interferer finished {} rounds ({} failed)",
            stats.rounds,
            stats.failures
        );
        stats
    }
}

/// Wait for the tick to change, giving up once `done` is set.
///
/// Returns the new tick, or `None` if the run completed first.
pub fn wait_for_tick_edge_or<T: TickOracle + ?Sized>(
    oracle: &T,
    done: &CompletionFlag,
) -> Option<Tick> {
    let first = oracle.observe_tick();
    loop {
        let now = oracle.observe_tick();
        if now != first {
            return Some(now);
        }
        if done.is_set() {
            return None;
        }
        core::hint::spin_loop();
    }
}

/// Request/acknowledge counters shared by the primary core and the flusher.
///
/// Sequence numbers only grow, so a retried attempt issues a fresh request
/// and never reuses a stale acknowledgement.
#[derive(Debug, Default)]
pub struct FlushHandshake {
    requested: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
}

impl FlushHandshake {
    /// No request issued yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary side: request a flush and spin until it has been performed.
    ///
    /// Must be called from one core only.
    pub fn request(&self) -> u64 {
        let seq = self.requested.load(Ordering::Relaxed) + 1;
        self.requested.store(seq, Ordering::Release);
        while self.completed.load(Ordering::Acquire) < seq {
            core::hint::spin_loop();
        }
        seq
    }

    /// Flusher side: perform `flush` once per request until `done` is set.
    ///
    /// Returns the number of flushes performed.
    pub fn serve<F: FnMut()>(&self, done: &CompletionFlag, mut flush: F) -> u64 {
        let mut served = 0;
        loop {
            let pending = self.requested.load(Ordering::Acquire);
            let acked = self.completed.load(Ordering::Relaxed);
            if pending > acked {
                flush();
                self.completed.store(pending, Ordering::Release);
                served += 1;
            } else if done.is_set() {
                return served;
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Follower side: wait for an acknowledgement newer than `seen`.
    ///
    /// Returns the new sequence number, or `None` once `done` is set.
    pub fn follow(&self, seen: u64, done: &CompletionFlag) -> Option<u64> {
        loop {
            let acked = self.completed.load(Ordering::Acquire);
            if acked > seen {
                return Some(acked);
            }
            if done.is_set() {
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// Acknowledged flushes so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tsc;
    use crate::tick::{SharedTick, TickSource};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn interferer_stops_after_completion() {
        let done = Arc::new(CompletionFlag::new());
        let tick = SharedTick::new();
        let source = TickSource::spawn(tick.clone(), Duration::from_millis(1), done.clone());

        let worker = {
            let done = done.clone();
            thread::spawn(move || {
                let interferer = Interferer::new(Tsc, tick, 1_000);
                let mut n = 0;
                interferer.run(&done, || {
                    n += 1;
                    if n % 2 == 0 {
                        -1
                    } else {
                        0
                    }
                })
            })
        };

        thread::sleep(Duration::from_millis(20));
        done.set();
        let stats = worker.join().unwrap();
        source.join();

        assert!(stats.rounds >= 2, "rounds = {}", stats.rounds);
        assert_eq!(stats.failures, stats.rounds / 2);
    }

    #[test]
    fn edge_wait_gives_up_once_done() {
        let done = CompletionFlag::new();
        done.set();
        assert_eq!(wait_for_tick_edge_or(&SharedTick::new(), &done), None);
    }

    #[test]
    fn handshake_performs_one_flush_per_request() {
        let done = Arc::new(CompletionFlag::new());
        let handshake = Arc::new(FlushHandshake::new());
        let flushes = Arc::new(AtomicUsize::new(0));

        let flusher = {
            let (done, handshake, flushes) = (done.clone(), handshake.clone(), flushes.clone());
            thread::spawn(move || {
                handshake.serve(&done, || {
                    flushes.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        for expected in 1..=100u64 {
            assert_eq!(handshake.request(), expected);
            assert_eq!(flushes.load(Ordering::SeqCst) as u64, expected);
        }
        done.set();
        assert_eq!(flusher.join().unwrap(), 100);
    }

    #[test]
    fn follower_sees_new_acknowledgements() {
        let done = Arc::new(CompletionFlag::new());
        let handshake = Arc::new(FlushHandshake::new());

        let flusher = {
            let (done, handshake) = (done.clone(), handshake.clone());
            thread::spawn(move || handshake.serve(&done, || {}))
        };

        handshake.request();
        assert_eq!(handshake.follow(0, &done), Some(1));
        done.set();
        assert_eq!(handshake.follow(1, &done), None);
        flusher.join().unwrap();
    }
}
