//! Narrow abstraction over the microkernel syscalls the rest of this stack
//! needs: capability lookup/revocation and the blocking semaphore primitive
//! threads suspend on. Everything else about the kernel's system-call ABI is
//! out of scope (spec.md §1 Non-goals); this trait seam is deliberately
//! small so `registry`/`parent`/`vcpu` can be exercised against an in-process
//! mock instead of real kernel objects (spec.md §9's "global singletons"
//! redesign flag: a handful of trait objects stand in for the free functions
//! that would otherwise reach a real kernel directly).

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("capability does not resolve to a live kernel object")]
    Dead,
    #[error("kernel revoke on a capability we just allocated failed")]
    RevokeFailed,
}

/// Capability-lookup and revocation, the only way this stack detects that a
/// client or service has died (spec.md §3 invariants, §5 cancellation model).
pub trait CapLookup: Send + Sync {
    /// True iff `cap` still resolves to a live kernel object.
    fn resolves(&self, cap: u32) -> bool;

    /// Revoke a capability. Per spec.md §7, a revoke failing on a capability
    /// the caller just allocated is an internal inconsistency severe enough
    /// to panic the root task; `revoke` itself only reports the outcome,
    /// callers decide whether to escalate via [`revoke_or_panic`].
    fn revoke(&self, cap: u32) -> Result<(), KernelError>;
}

/// Revoke `cap`, panicking if the kernel reports failure. Used exactly where
/// the original root task asserts after `nova_revoke`.
pub fn revoke_or_panic(kernel: &dyn CapLookup, cap: u32) {
    if let Err(e) = kernel.revoke(cap) {
        panic!("revoke of capability {cap} failed: {e}");
    }
}

/// The blocking primitive threads suspend on (parent-protocol session waits,
/// VCPU halt/wakeup, BIOS disk HLT-wait). Backed by the kernel's semaphore
/// object in production; a simple condvar-backed counter in tests.
pub trait Semaphore: Send + Sync {
    fn up(&self);
    fn down(&self);
}

/// In-process mock of the kernel's capability table, for unit and
/// integration tests that exercise `registry`/`parent`/`vcpu` without a real
/// kernel underneath.
#[derive(Default)]
pub struct MockKernel {
    live: Mutex<HashSet<u32>>,
}

impl MockKernel {
    pub fn new() -> Self {
        MockKernel::default()
    }

    /// Mark a capability as resolving to a live object (as if just allocated).
    pub fn birth(&self, cap: u32) {
        self.live.lock().unwrap().insert(cap);
    }

    /// Simulate the owning kernel object dying without going through revoke
    /// (used to exercise death detection).
    pub fn kill(&self, cap: u32) {
        self.live.lock().unwrap().remove(&cap);
    }
}

impl CapLookup for MockKernel {
    fn resolves(&self, cap: u32) -> bool {
        self.live.lock().unwrap().contains(&cap)
    }

    fn revoke(&self, cap: u32) -> Result<(), KernelError> {
        let mut live = self.live.lock().unwrap();
        if live.remove(&cap) {
            Ok(())
        } else {
            Err(KernelError::Dead)
        }
    }
}

/// Condvar-backed counting semaphore, suitable as the default in-process
/// implementation of [`Semaphore`] wherever a real kernel object is not
/// available (tests, and any host-side waiter that does not cross a portal).
#[derive(Default)]
pub struct CountingSemaphore {
    count: Mutex<u64>,
    cv: Condvar,
}

impl CountingSemaphore {
    pub fn new() -> Self {
        CountingSemaphore::default()
    }
}

impl Semaphore for CountingSemaphore {
    fn up(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    fn down(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_kernel_tracks_births_and_deaths() {
        let k = MockKernel::new();
        k.birth(7);
        assert!(k.resolves(7));
        k.kill(7);
        assert!(!k.resolves(7));
    }

    #[test]
    fn revoke_fails_on_already_dead_capability() {
        let k = MockKernel::new();
        k.birth(1);
        k.kill(1);
        assert_eq!(k.revoke(1), Err(KernelError::Dead));
    }

    #[test]
    fn revoke_or_panic_panics_on_dead_capability() {
        let k = MockKernel::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            revoke_or_panic(&k, 99);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn counting_semaphore_up_then_down_does_not_block() {
        let sem = CountingSemaphore::new();
        sem.up();
        sem.down();
    }

    #[test]
    fn counting_semaphore_wakes_a_blocked_waiter() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let sem = Arc::new(CountingSemaphore::new());
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.down();
        });
        thread::sleep(Duration::from_millis(20));
        sem.up();
        handle.join().unwrap();
    }
}
