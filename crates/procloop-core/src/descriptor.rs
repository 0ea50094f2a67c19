//! Reference-counted OS descriptors.
//!
//! A worker may be in the middle of a `read`/`write` on a pipe while an
//! application thread asks for that pipe to be closed. Closing immediately
//! would let the OS hand the same number to an unrelated file before the
//! syscall completes. [`RefCountedDescriptor`] defers the real close until
//! every in-flight user has released it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Raw OS descriptor: a file descriptor on Unix, a `HANDLE` on Windows.
#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;

/// Raw OS descriptor: a file descriptor on Unix, a `HANDLE` on Windows.
#[cfg(windows)]
pub type RawDescriptor = isize;

/// Value reported by [`RefCountedDescriptor::raw`] once the descriptor is closed.
pub const CLOSED: RawDescriptor = -1;

const CLOSED_BIT: usize = 1;
const REF_UNIT: usize = 2;

/// One OS descriptor with an atomic use count and a close-requested bit.
///
/// The OS-level close happens exactly once: when a close has been requested
/// and the use count is zero.
pub struct RefCountedDescriptor {
    raw: RawDescriptor,
    // use count << 1 | CLOSED_BIT
    state: AtomicUsize,
    released: AtomicBool,
    closer: fn(RawDescriptor),
}

impl RefCountedDescriptor {
    /// Take ownership of `raw`. Passing [`CLOSED`] yields a closed descriptor.
    pub fn new(raw: RawDescriptor) -> Self {
        Self::with_closer(raw, crate::platform::close_descriptor)
    }

    /// A descriptor that was never open.
    pub fn closed() -> Self {
        Self::new(CLOSED)
    }

    pub(crate) fn with_closer(raw: RawDescriptor, closer: fn(RawDescriptor)) -> Self {
        let initial = if raw == CLOSED { CLOSED_BIT } else { 0 };
        Self {
            raw,
            state: AtomicUsize::new(initial),
            released: AtomicBool::new(raw == CLOSED),
            closer,
        }
    }

    /// Borrow the descriptor for one syscall.
    ///
    /// Returns `None` once a close has been requested; the raw value is
    /// never handed out after that point.
    pub fn acquire(&self) -> Option<DescriptorGuard<'_>> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & CLOSED_BIT != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                current + REF_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(DescriptorGuard { owner: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Request the close. Idempotent.
    ///
    /// Returns `true` only for the call that flipped the descriptor to
    /// closed. The OS close runs now if nobody holds a guard, otherwise when
    /// the last guard drops.
    pub fn close(&self) -> bool {
        let previous = self.state.fetch_or(CLOSED_BIT, Ordering::AcqRel);
        if previous & CLOSED_BIT != 0 {
            return false;
        }
        if previous == 0 {
            self.release_os_descriptor();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    /// The raw value, or [`CLOSED`] once a close has been requested.
    pub fn raw(&self) -> RawDescriptor {
        if self.is_closed() {
            CLOSED
        } else {
            self.raw
        }
    }

    fn release(&self) {
        let previous = self.state.fetch_sub(REF_UNIT, Ordering::AcqRel);
        debug_assert!(previous >= REF_UNIT, "descriptor released more often than acquired");
        if previous == REF_UNIT | CLOSED_BIT {
            self.release_os_descriptor();
        }
    }

    fn release_os_descriptor(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            (self.closer)(self.raw);
        }
    }
}

impl Drop for RefCountedDescriptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RefCountedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Acquire);
        f.debug_struct("RefCountedDescriptor")
            .field("raw", &self.raw)
            .field("in_use", &(state / REF_UNIT))
            .field("closed", &(state & CLOSED_BIT != 0))
            .finish()
    }
}

/// Proof that the descriptor stays open until this guard drops.
pub struct DescriptorGuard<'a> {
    owner: &'a RefCountedDescriptor,
}

impl DescriptorGuard<'_> {
    pub fn raw(&self) -> RawDescriptor {
        self.owner.raw
    }
}

impl Drop for DescriptorGuard<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    static COUNTERS: [AtomicUsize; 8] = [const { AtomicUsize::new(0) }; 8];

    fn closer(raw: RawDescriptor) {
        COUNTERS[raw as usize].fetch_add(1, Ordering::SeqCst);
    }

    // Each test uses its own descriptor value, so counters never collide.
    fn closes_of(raw: RawDescriptor) -> usize {
        COUNTERS[raw as usize].load(Ordering::SeqCst)
    }

    #[test]
    fn test_close_without_users_closes_once() {
        let desc = RefCountedDescriptor::with_closer(1, closer);
        assert!(desc.close());
        assert!(!desc.close());
        assert_eq!(closes_of(1), 1);
        drop(desc);
        assert_eq!(closes_of(1), 1);
    }

    #[test]
    fn test_close_deferred_until_guard_drops() {
        let desc = RefCountedDescriptor::with_closer(2, closer);
        let guard = desc.acquire().unwrap();
        assert_eq!(guard.raw(), 2);

        assert!(desc.close());
        assert_eq!(closes_of(2), 0);
        assert_eq!(desc.raw(), CLOSED);
        assert!(desc.acquire().is_none());

        drop(guard);
        assert_eq!(closes_of(2), 1);
    }

    #[test]
    fn test_acquire_after_close_always_fails() {
        let desc = RefCountedDescriptor::with_closer(3, closer);
        desc.close();
        for _ in 0..100 {
            assert!(desc.acquire().is_none());
        }
        assert!(desc.is_closed());
        assert_eq!(closes_of(3), 1);
    }

    #[test]
    fn test_closed_sentinel_never_closes() {
        let desc = RefCountedDescriptor::closed();
        assert!(desc.is_closed());
        assert_eq!(desc.raw(), CLOSED);
        assert!(desc.acquire().is_none());
        assert!(!desc.close());
    }

    #[test]
    fn test_drop_closes() {
        let desc = RefCountedDescriptor::with_closer(4, closer);
        drop(desc);
        assert_eq!(closes_of(4), 1);
    }

    #[test]
    fn test_concurrent_acquire_and_close() {
        let desc = Arc::new(RefCountedDescriptor::with_closer(5, closer));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let desc = Arc::clone(&desc);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        if let Some(guard) = desc.acquire() {
                            assert_eq!(guard.raw(), 5);
                        }
                    }
                })
            })
            .collect();
        desc.close();
        desc.close();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(closes_of(5), 1);
    }
}
