//! Pin run threads to fixed CPUs.
//!
//! Every role of a run is pinned to one CPU for its whole lifetime so that
//! cycle counters stay core-local and the sender/receiver layout matches the
//! physical topology.
//!
//! - **Linux**: `sched_setaffinity` with a single-CPU mask; the previous mask
//!   is restored when the guard drops.
//! - **Other platforms**: pinning is reported as unavailable and the run
//!   continues unpinned.
//!
//! Cores of a run map onto [`allowed_cpus`] by position, so a run confined to
//! a cpuset such as `4-7` pins its core 0 to CPU 4.

/// Outcome of a pinning request.
#[derive(Debug)]
pub enum Pinning {
    /// The thread is pinned while the guard lives.
    Pinned(AffinityGuard),
    /// The thread was left where the scheduler put it.
    NotPinned {
        /// Why pinning was not possible.
        reason: String,
    },
}

impl Pinning {
    /// Whether the request succeeded.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Pinning::Pinned(_))
    }
}

/// Restores the previous affinity mask on drop.
#[derive(Debug)]
pub struct AffinityGuard {
    cpu: usize,
    #[cfg(target_os = "linux")]
    previous: CpuMask,
}

#[cfg(target_os = "linux")]
struct CpuMask(libc::cpu_set_t);

#[cfg(target_os = "linux")]
impl std::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CpuMask(..)")
    }
}

impl AffinityGuard {
    /// Pin the calling thread to `cpu`.
    pub fn pin_to(cpu: usize) -> Pinning {
        #[cfg(target_os = "linux")]
        {
            Self::pin_linux(cpu)
        }

        #[cfg(not(target_os = "linux"))]
        {
            Pinning::NotPinned {
                reason: format!("cannot pin to CPU {}: affinity not supported on this platform", cpu),
            }
        }
    }

    /// CPU the thread is pinned to.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[cfg(target_os = "linux")]
    fn pin_linux(cpu: usize) -> Pinning {
        use std::mem::{size_of, MaybeUninit};

        if cpu >= libc::CPU_SETSIZE as usize {
            return Pinning::NotPinned {
                reason: format!("CPU {} exceeds CPU_SETSIZE", cpu),
            };
        }

        let mut previous = MaybeUninit::<libc::cpu_set_t>::uninit();
        // SAFETY: the kernel writes at most size_of::<cpu_set_t>() bytes.
        let rc = unsafe { libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), previous.as_mut_ptr()) };
        if rc != 0 {
            return Pinning::NotPinned {
                reason: format!("sched_getaffinity failed: {}", std::io::Error::last_os_error()),
            };
        }
        // SAFETY: sched_getaffinity succeeded and filled the mask.
        let previous = unsafe { previous.assume_init() };

        // SAFETY: cpu_set_t is plain data; CPU_SET is bounds-checked above.
        let rc = unsafe {
            let mut mask: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut mask);
            libc::CPU_SET(cpu, &mut mask);
            libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &mask)
        };
        if rc != 0 {
            return Pinning::NotPinned {
                reason: format!(
                    "sched_setaffinity to CPU {} failed: {}",
                    cpu,
                    std::io::Error::last_os_error()
                ),
            };
        }

        tracing::debug!("pinned thread to CPU {}", cpu);
        Pinning::Pinned(AffinityGuard {
            cpu,
            previous: CpuMask(previous),
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for AffinityGuard {
    fn drop(&mut self) {
        // SAFETY: restoring a mask previously returned by the kernel.
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &self.previous.0)
        };
        if rc != 0 {
            tracing::warn!(
                "failed to restore CPU affinity after CPU {}: {}",
                self.cpu,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Number of CPUs the process may run on.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// CPU ids in the calling thread's affinity mask, in ascending order.
///
/// Inside a restricted cpuset the ids need not start at zero. Falls back to
/// `0..available_cpus()` when the mask cannot be read. Never empty.
pub fn allowed_cpus() -> Vec<usize> {
    #[cfg(target_os = "linux")]
    {
        if let Some(cpus) = allowed_cpus_linux() {
            return cpus;
        }
    }
    (0..available_cpus()).collect()
}

#[cfg(target_os = "linux")]
fn allowed_cpus_linux() -> Option<Vec<usize>> {
    use std::mem::{size_of, MaybeUninit};

    let mut mask = MaybeUninit::<libc::cpu_set_t>::uninit();
    // SAFETY: the kernel writes at most size_of::<cpu_set_t>() bytes.
    let rc = unsafe { libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), mask.as_mut_ptr()) };
    if rc != 0 {
        tracing::debug!("sched_getaffinity failed: {}", std::io::Error::last_os_error());
        return None;
    }
    // SAFETY: sched_getaffinity succeeded and filled the mask.
    let mask = unsafe { mask.assume_init() };
    let cpus: Vec<usize> = (0..libc::CPU_SETSIZE as usize)
        // SAFETY: `cpu` is below CPU_SETSIZE.
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &mask) })
        .collect();
    (!cpus.is_empty()).then_some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn pin_to_current_cpu_succeeds() {
        // SAFETY: sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        assert!(cpu >= 0);
        match AffinityGuard::pin_to(cpu as usize) {
            Pinning::Pinned(guard) => assert_eq!(guard.cpu(), cpu as usize),
            Pinning::NotPinned { reason } => panic!("pinning failed: {}", reason),
        }
    }

    #[test]
    fn out_of_range_cpu_is_not_pinned() {
        assert!(!AffinityGuard::pin_to(1 << 20).is_pinned());
    }

    #[test]
    fn at_least_one_cpu() {
        assert!(available_cpus() >= 1);
        assert!(!allowed_cpus().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn every_allowed_cpu_can_be_pinned() {
        let cpus = allowed_cpus();
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
        for &cpu in cpus.iter().take(8) {
            match AffinityGuard::pin_to(cpu) {
                Pinning::Pinned(guard) => assert_eq!(guard.cpu(), cpu),
                Pinning::NotPinned { reason } => panic!("CPU {} not pinnable: {}", cpu, reason),
            }
        }
    }
}
