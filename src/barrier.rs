//! Cross-core start barrier over a single shared counter.
//!
//! Every participant fetch-adds the counter and spins until it reaches the
//! end of its round: the smallest multiple of the participant count that is
//! at least its own post-increment value. The counter is never reset; each
//! round consumes exactly `participants` increments, so the same barrier
//! serves any number of successive synchronisation points.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Spin barrier shared by all cores of a run.
#[derive(Debug, Default)]
pub struct CoreBarrier {
    arrivals: CachePadded<AtomicU64>,
}

impl CoreBarrier {
    /// A barrier whose counter starts at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrive and spin until `participants` cores have arrived in this round.
    ///
    /// Returns the counter value that released this participant.
    ///
    /// # Panics
    ///
    /// Panics if `participants` is zero.
    pub fn enter(&self, participants: usize) -> u64 {
        assert!(participants > 0, "participants must be > 0");
        let n = participants as u64;
        let before = self.arrivals.fetch_add(1, Ordering::AcqRel);
        let release = (before / n + 1) * n;
        while self.arrivals.load(Ordering::Acquire) < release {
            core::hint::spin_loop();
        }
        release
    }

    /// Total increments consumed so far.
    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Acquire)
    }

    /// Number of rounds fully released for `participants` cores.
    pub fn rounds_completed(&self, participants: usize) -> u64 {
        self.arrivals() / participants.max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_participant_never_blocks() {
        let barrier = CoreBarrier::new();
        assert_eq!(barrier.enter(1), 1);
        assert_eq!(barrier.enter(1), 2);
        assert_eq!(barrier.rounds_completed(1), 2);
    }

    #[test]
    fn nobody_released_before_last_arrival() {
        const N: usize = 4;
        let barrier = Arc::new(CoreBarrier::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let barrier = barrier.clone();
                let entered = entered.clone();
                thread::spawn(move || {
                    // Stagger arrivals so early threads really spin.
                    thread::sleep(Duration::from_millis(5 * i as u64));
                    entered.fetch_add(1, Ordering::SeqCst);
                    let release = barrier.enter(N);
                    assert_eq!(entered.load(Ordering::SeqCst), N);
                    release
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), N as u64);
        }
        assert_eq!(barrier.arrivals(), N as u64);
    }

    #[test]
    fn reusable_across_rounds() {
        const N: usize = 4;
        const ROUNDS: u64 = 50;
        let barrier = Arc::new(CoreBarrier::new());

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    for round in 1..=ROUNDS {
                        assert_eq!(barrier.enter(N), round * N as u64);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(barrier.arrivals(), ROUNDS * N as u64);
        assert_eq!(barrier.rounds_completed(N), ROUNDS);
    }

    #[test]
    #[should_panic(expected = "participants must be > 0")]
    fn zero_participants_panics() {
        CoreBarrier::new().enter(0);
    }
}
