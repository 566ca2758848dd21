//! Completion counter for asynchronous work.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A counter that tracked operations bump once each when they finish.
///
/// Waiting blocks the calling thread. Never wait on the render thread.
#[derive(Debug, Default)]
pub struct Fence {
    count: Mutex<u64>,
    changed: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed operation and wake waiters.
    pub fn complete(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.changed.notify_all();
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Block until at least `expected` operations have completed.
    pub fn wait(&self, expected: u64) {
        let mut count = self.count.lock();
        while *count < expected {
            self.changed.wait(&mut count);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns whether
    /// the count was reached.
    pub fn wait_timeout(&self, expected: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < expected {
            if self.changed.wait_until(&mut count, deadline).timed_out() {
                return *count >= expected;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_after_completions() {
        let fence = Arc::new(Fence::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let fence = fence.clone();
                thread::spawn(move || fence.complete())
            })
            .collect();
        fence.wait(4);
        assert_eq!(fence.count(), 4);
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn timeout_when_nothing_completes() {
        let fence = Fence::new();
        assert!(!fence.wait_timeout(1, Duration::from_millis(10)));
        fence.complete();
        assert!(fence.wait_timeout(1, Duration::from_millis(10)));
    }
}
