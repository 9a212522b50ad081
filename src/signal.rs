//! Cache-line partitioned signal slots for cross-core completion signalling.
//!
//! The channel is a fixed array of 64-bit words, one per cache line, indexed
//! by a logical sender/receiver id. A slot is zeroed by the side that waits on
//! it, written with a non-zero payload (a timestamp or a sentinel) by the
//! side that completes, and busy-polled until non-zero. Zero always means
//! "not signalled yet".
//!
//! Each core also owns a ready flag, set once its receive loop is running, so
//! a sender never races against an uninitialised slot.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Error, Result};

/// Shared array of signal slots plus per-core ready flags.
#[derive(Debug)]
pub struct SignalChannel {
    slots: Box<[CachePadded<AtomicU64>]>,
    ready: Box<[CachePadded<AtomicBool>]>,
}

impl SignalChannel {
    /// A channel with `slots` zeroed slots and `cores` cleared ready flags.
    pub fn new(slots: usize, cores: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            ready: (0..cores).map(|_| CachePadded::new(AtomicBool::new(false))).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the channel has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of cores with a ready flag.
    pub fn cores(&self) -> usize {
        self.ready.len()
    }

    /// Handle to slot `index`.
    pub fn slot(&self, index: usize) -> Result<Slot<'_>> {
        self.slots
            .get(index)
            .map(|cell| Slot { cell })
            .ok_or(Error::SlotOutOfRange {
                index,
                len: self.slots.len(),
            })
    }

    /// Slot index paired with `core` at a fixed sender/receiver `offset`.
    pub fn slot_for(&self, core: usize, offset: usize) -> Result<usize> {
        let index = core + offset;
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(Error::SlotOutOfRange {
                index,
                len: self.slots.len(),
            })
        }
    }

    fn ready_flag(&self, core: usize) -> Result<&AtomicBool> {
        self.ready
            .get(core)
            .map(|flag| &**flag)
            .ok_or(Error::SlotOutOfRange {
                index: core,
                len: self.ready.len(),
            })
    }

    /// Announce that `core`'s receive loop is active.
    pub fn mark_ready(&self, core: usize) -> Result<()> {
        self.ready_flag(core)?.store(true, Ordering::Release);
        Ok(())
    }

    /// Has `core` announced readiness?
    pub fn is_ready(&self, core: usize) -> Result<bool> {
        Ok(self.ready_flag(core)?.load(Ordering::Acquire))
    }

    /// Spin until `core` is ready.
    pub fn wait_ready(&self, core: usize) -> Result<()> {
        let flag = self.ready_flag(core)?;
        while !flag.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        Ok(())
    }
}

/// Borrowed handle to one signal slot.
#[derive(Debug, Clone, Copy)]
pub struct Slot<'a> {
    cell: &'a AtomicU64,
}

impl Slot<'_> {
    /// Clear the slot before a new round.
    #[inline]
    pub fn reset(&self) {
        self.cell.store(0, Ordering::Release);
    }

    /// Signal completion with `payload`.
    #[inline]
    pub fn post(&self, payload: NonZeroU64) {
        self.cell.store(payload.get(), Ordering::Release);
    }

    /// Signal completion with a raw value, rejecting zero.
    pub fn post_value(&self, payload: u64) -> Result<()> {
        let payload = NonZeroU64::new(payload).ok_or(Error::ZeroPayload)?;
        self.post(payload);
        Ok(())
    }

    /// Current payload, if signalled.
    #[inline]
    pub fn poll(&self) -> Option<NonZeroU64> {
        NonZeroU64::new(self.cell.load(Ordering::Acquire))
    }

    /// Spin until the slot holds a payload.
    #[inline]
    pub fn wait(&self) -> NonZeroU64 {
        loop {
            if let Some(payload) = self.poll() {
                return payload;
            }
            core::hint::spin_loop();
        }
    }

    /// Take the payload if signalled, clearing the slot.
    #[inline]
    pub fn take(&self) -> Option<NonZeroU64> {
        NonZeroU64::new(self.cell.swap(0, Ordering::AcqRel))
    }
}
