//! Run-wide completion flag.
//!
//! Zero when a run starts, set exactly once by the core driving the primary
//! measurement, never reset. Receivers, interferers and idle cores poll it at
//! round boundaries (never mid-measurement) and exit once it is set.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

/// Shared "the primary test has finished" flag.
#[derive(Debug, Default)]
pub struct CompletionFlag {
    done: CachePadded<AtomicBool>,
}

impl CompletionFlag {
    /// A flag in the "running" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run complete. Returns `true` for the call that set it.
    pub fn set(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Has the run completed?
    #[inline]
    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin until the run completes.
    pub fn wait(&self) {
        while !self.is_set() {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_reports_first_writer_only() {
        let flag = CompletionFlag::new();
        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }

    #[test]
    fn waiters_release_after_set() {
        let flag = Arc::new(CompletionFlag::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let flag = flag.clone();
                thread::spawn(move || flag.wait())
            })
            .collect();
        flag.set();
        for w in waiters {
            w.join().unwrap();
        }
    }
}
