//! Single-fire exit latch.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Holds the exit code once the exit transition has run.
///
/// The code is recorded when the transition starts and waiters are released
/// when it ends, so `get` already answers inside `on_exit` while `wait` only
/// returns after it.
#[derive(Debug, Default)]
pub(crate) struct ExitLatch {
    state: Mutex<LatchState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct LatchState {
    code: Option<i32>,
    released: bool,
}

impl ExitLatch {
    /// Store `code` without waking anyone. Only the first call has effect.
    pub(crate) fn record(&self, code: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.code.is_some() {
            return false;
        }
        state.code = Some(code);
        true
    }

    /// Store `code` if nothing was recorded yet and wake all waiters.
    /// Returns `true` if this call stored the code.
    pub(crate) fn release(&self, code: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        let first = state.code.is_none();
        if first {
            state.code = Some(code);
        }
        if !state.released {
            state.released = true;
            self.released.notify_all();
        }
        first
    }

    pub(crate) fn get(&self) -> Option<i32> {
        self.state.lock().unwrap().code
    }

    pub(crate) fn wait(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        loop {
            if let (true, Some(code)) = (state.released, state.code) {
                return code;
            }
            state = self.released.wait(state).unwrap();
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let (true, Some(code)) = (state.released, state.code) {
                return Some(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.released.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_release_once() {
        let latch = ExitLatch::default();
        assert_eq!(latch.get(), None);
        assert!(latch.release(3));
        assert!(!latch.release(4));
        assert_eq!(latch.get(), Some(3));
        assert_eq!(latch.wait(), 3);
    }

    #[test]
    fn test_recorded_code_is_visible_before_release() {
        let latch = ExitLatch::default();
        assert!(latch.record(7));
        assert!(!latch.record(8));
        assert_eq!(latch.get(), Some(7));
        assert_eq!(latch.wait_timeout(Duration::from_millis(20)), None);

        assert!(!latch.release(9));
        assert_eq!(latch.wait(), 7);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = ExitLatch::default();
        assert_eq!(latch.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_wait_across_threads() {
        let latch = Arc::new(ExitLatch::default());
        let waiter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        latch.release(42);
        assert_eq!(waiter.join().unwrap(), 42);
    }
}
