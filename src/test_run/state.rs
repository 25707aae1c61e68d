//! System-wide record of running tests.
//!
//! A cloneable handle shared by every orchestration call site. Starting a
//! test hands out a [`TestActivityGuard`]; dropping the guard ends the test,
//! so every exit path decrements exactly once.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug)]
struct Inner {
    count: Mutex<usize>,
    active: watch::Sender<bool>,
}

/// Shared test-activity counter.
#[derive(Debug, Clone)]
pub struct TestStateManager {
    inner: Arc<Inner>,
}

impl Default for TestStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStateManager {
    /// Counter at zero.
    pub fn new() -> Self {
        let (active, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                count: Mutex::new(0),
                active,
            }),
        }
    }

    /// Claim the test slot if no test is running.
    ///
    /// The check and the increment happen under one lock.
    pub fn try_begin(&self) -> Option<TestActivityGuard> {
        let mut count = self.inner.count.lock();
        if *count > 0 {
            return None;
        }
        *count = 1;
        self.inner.active.send_replace(true);
        debug!("Test activity started");
        Some(TestActivityGuard {
            manager: self.clone(),
        })
    }

    /// Register one more active test unconditionally.
    pub fn begin(&self) -> TestActivityGuard {
        let mut count = self.inner.count.lock();
        *count += 1;
        if *count == 1 {
            self.inner.active.send_replace(true);
        }
        TestActivityGuard {
            manager: self.clone(),
        }
    }

    fn end(&self) {
        let mut count = self.inner.count.lock();
        match count.checked_sub(1) {
            Some(remaining) => {
                *count = remaining;
                if remaining == 0 {
                    self.inner.active.send_replace(false);
                    debug!("Test activity finished");
                }
            }
            None => warn!("Test activity ended more often than it started"),
        }
    }

    /// Whether any test is running.
    pub fn is_test_in_progress(&self) -> bool {
        self.active_count() > 0
    }

    /// Number of active tests.
    pub fn active_count(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Follow activity changes: `true` while any test runs.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.active.subscribe()
    }
}

/// Proof of one active test; the count drops when this does.
#[derive(Debug)]
#[must_use = "the test ends as soon as the guard is dropped"]
pub struct TestActivityGuard {
    manager: TestStateManager,
}

impl Drop for TestActivityGuard {
    fn drop(&mut self) {
        self.manager.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn only_one_test_at_a_time() {
        let manager = TestStateManager::new();
        let guard = manager.try_begin().unwrap();
        assert!(manager.is_test_in_progress());
        assert!(manager.try_begin().is_none());
        drop(guard);
        assert!(!manager.is_test_in_progress());
        assert!(manager.try_begin().is_some());
    }

    #[test]
    fn watch_reports_first_start_and_last_finish() {
        let manager = TestStateManager::new();
        let rx = manager.subscribe();
        assert!(!*rx.borrow());

        let a = manager.begin();
        let b = manager.begin();
        assert!(*rx.borrow());
        drop(a);
        assert!(*rx.borrow());
        drop(b);
        assert!(!*rx.borrow());
    }

    #[test]
    fn guard_released_on_panic() {
        let manager = TestStateManager::new();
        let clone = manager.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = clone.begin();
            panic!("test body failed");
        }));
        assert!(result.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    proptest! {
        #[test]
        fn counter_never_negative(ops in proptest::collection::vec(any::<bool>(), 0..100)) {
            let manager = TestStateManager::new();
            let mut guards = Vec::new();
            for start in ops {
                if start {
                    guards.push(manager.begin());
                } else {
                    guards.pop();
                }
                prop_assert_eq!(manager.active_count(), guards.len());
            }
            guards.clear();
            prop_assert_eq!(manager.active_count(), 0);
        }
    }
}
