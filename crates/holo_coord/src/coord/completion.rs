//! Scatter-gather completion tracking.
//!
//! A fanned-out write arms the tracker with the number of sub-requests and
//! waits; each sub-request completes exactly once from whatever thread its
//! reply or timeout lands on. Counter and flags share one mutex so the zero
//! crossing is linearizable: each `arm` has exactly one "became done" call.
//!
//! `CompletionGuard` is the per-sub-request token. Consuming it completes the
//! sub-request; dropping it unfinished counts as an error, so a lost callback
//! cannot leave the waiter hanging.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::CoordError;

#[derive(Debug, Default)]
struct CounterState {
    outstanding: usize,
    retries: bool,
    errors: bool,
    done: bool,
    /// Bumped by every `arm`; guards from an older arming are ignored.
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct CompletionTracker {
    state: Mutex<CounterState>,
    cv: Condvar,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reset to `count` outstanding sub-requests and clear all flags.
    pub fn arm(&self, count: usize) {
        let mut state = self.lock();
        Self::arm_locked(&mut state, count);
        if state.done {
            self.cv.notify_all();
        }
    }

    fn arm_locked(state: &mut CounterState, count: usize) -> u64 {
        state.outstanding = count;
        state.done = count == 0;
        state.retries = false;
        state.errors = false;
        state.epoch = state.epoch.wrapping_add(1);
        state.epoch
    }

    /// Arm with `count` and hand out one guard per sub-request.
    pub fn arm_guards(self: &Arc<Self>, count: usize) -> Vec<CompletionGuard> {
        let epoch = {
            let mut state = self.lock();
            let epoch = Self::arm_locked(&mut state, count);
            if state.done {
                self.cv.notify_all();
            }
            epoch
        };
        (0..count)
            .map(|_| CompletionGuard {
                tracker: self.clone(),
                epoch,
                finished: false,
            })
            .collect()
    }

    /// Count one sub-request as finished.
    ///
    /// Returns `Ok(true)` for the call that completed the tracker.
    pub fn decrement(&self) -> Result<bool, CoordError> {
        let mut state = self.lock();
        self.decrement_locked(&mut state)
    }

    fn decrement_locked(&self, state: &mut CounterState) -> Result<bool, CoordError> {
        if state.outstanding == 0 {
            return Err(CoordError::InvariantViolation(
                "decrement on a completion tracker with nothing outstanding".to_string(),
            ));
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.done = true;
            self.cv.notify_all();
            return Ok(true);
        }
        Ok(false)
    }

    /// Flag update plus decrement for one guard, as a single step.
    fn complete(&self, epoch: u64, error: bool) -> Result<bool, CoordError> {
        let mut state = self.lock();
        if state.epoch != epoch {
            tracing::trace!(epoch, current = state.epoch, "stale completion ignored");
            return Ok(false);
        }
        if error && !state.done {
            state.errors = true;
        }
        self.decrement_locked(&mut state)
    }

    fn mark_retry_for(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch == epoch && !state.done {
            state.retries = true;
        }
    }

    /// Note that a sub-request had to be retried. Ignored once done.
    pub fn mark_retry(&self) {
        let mut state = self.lock();
        if !state.done {
            state.retries = true;
        }
    }

    /// Note that a sub-request failed. Ignored once done.
    pub fn mark_error(&self) {
        let mut state = self.lock();
        if !state.done {
            state.errors = true;
        }
    }

    /// Acknowledge errors already handled by the caller.
    pub fn clear_errors(&self) {
        self.lock().errors = false;
    }

    /// Block until every sub-request has completed or `deadline` passes.
    ///
    /// On success returns whether the run was clean (no retries, no errors).
    /// On timeout the outstanding count is left as is.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, CoordError> {
        let mut state = self.lock();
        while state.outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoordError::Timeout);
            }
            state = self
                .cv
                .wait_timeout(state, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        Ok(!(state.retries || state.errors))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, CoordError> {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    pub fn has_retries(&self) -> bool {
        self.lock().retries
    }

    pub fn has_errors(&self) -> bool {
        self.lock().errors
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }
}

/// Completion token for one sub-request of an armed tracker.
#[derive(Debug)]
pub struct CompletionGuard {
    tracker: Arc<CompletionTracker>,
    epoch: u64,
    finished: bool,
}

impl CompletionGuard {
    pub fn succeed(mut self) {
        self.finish(false);
    }

    pub fn fail(mut self) {
        self.finish(true);
    }

    /// Record an internal retry; the sub-request is still outstanding.
    pub fn retried(&self) {
        self.tracker.mark_retry_for(self.epoch);
    }

    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    fn finish(&mut self, error: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(err) = self.tracker.complete(self.epoch, error) {
            tracing::error!(error = %err, "completion guard finished twice");
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("completion guard dropped before completing; counting as error");
            self.finish(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn concurrent_decrements_complete_exactly_once() {
        for n in [1usize, 2, 7, 64] {
            let tracker = Arc::new(CompletionTracker::new());
            tracker.arm(n);
            let finishers = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..n)
                .map(|_| {
                    let tracker = tracker.clone();
                    let finishers = finishers.clone();
                    std::thread::spawn(move || {
                        if tracker.decrement().expect("decrement") {
                            finishers.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(finishers.load(Ordering::SeqCst), 1, "n={n}");
            assert!(tracker.is_done());
            assert_eq!(tracker.wait_timeout(Duration::from_millis(10)), Ok(true));
        }
    }

    #[test]
    fn decrement_past_zero_is_an_invariant_violation() {
        let tracker = CompletionTracker::new();
        tracker.arm(2);
        assert_eq!(tracker.decrement(), Ok(false));
        assert_eq!(tracker.decrement(), Ok(true));
        assert!(matches!(
            tracker.decrement(),
            Err(CoordError::InvariantViolation(_))
        ));
        assert!(tracker.is_done());
    }

    #[test]
    fn arming_with_zero_is_immediately_done() {
        let tracker = CompletionTracker::new();
        tracker.arm(0);
        assert!(tracker.is_done());
        assert_eq!(tracker.wait_timeout(Duration::ZERO), Ok(true));
    }

    #[test]
    fn wait_times_out_without_touching_the_count() {
        let tracker = CompletionTracker::new();
        tracker.arm(3);
        tracker.decrement().unwrap();
        assert_eq!(
            tracker.wait_timeout(Duration::from_millis(20)),
            Err(CoordError::Timeout)
        );
        assert_eq!(tracker.outstanding(), 2);
        assert!(!tracker.is_done());
    }

    #[test]
    fn blocked_waiter_wakes_on_last_decrement() {
        let tracker = Arc::new(CompletionTracker::new());
        tracker.arm(2);
        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        tracker.mark_retry();
        tracker.decrement().unwrap();
        tracker.decrement().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(false));
        assert!(tracker.has_retries());
    }

    #[test]
    fn fan_out_with_one_failure_reports_errors_only() {
        let tracker = Arc::new(CompletionTracker::new());
        let mut guards = tracker.arm_guards(3);
        let failed = guards.pop().unwrap();

        let threads: Vec<_> = guards
            .into_iter()
            .map(|guard| std::thread::spawn(move || guard.succeed()))
            .chain(std::iter::once(std::thread::spawn(move || failed.fail())))
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(tracker.is_done());
        assert!(tracker.has_errors());
        assert!(!tracker.has_retries());
        assert_eq!(tracker.wait_timeout(Duration::from_millis(10)), Ok(false));
    }

    #[test]
    fn three_completions_with_one_marked_error() {
        let tracker = Arc::new(CompletionTracker::new());
        tracker.arm(3);
        let threads: Vec<_> = [false, false, true]
            .into_iter()
            .map(|failed| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    if failed {
                        tracker.mark_error();
                    }
                    tracker.decrement().unwrap();
                })
            })
            .collect();
        assert_eq!(tracker.wait_timeout(Duration::from_secs(5)), Ok(false));
        for t in threads {
            t.join().unwrap();
        }
        assert!(tracker.is_done());
        assert!(tracker.has_errors());
        assert!(!tracker.has_retries());
    }

    #[test]
    fn dropped_guard_counts_as_error() {
        let tracker = Arc::new(CompletionTracker::new());
        let mut guards = tracker.arm_guards(2);
        guards.pop().unwrap().succeed();
        drop(guards);
        assert!(tracker.is_done());
        assert!(tracker.has_errors());
    }

    #[test]
    fn stale_guards_do_not_touch_a_rearmed_tracker() {
        let tracker = Arc::new(CompletionTracker::new());
        let old = tracker.arm_guards(1);
        let fresh = tracker.arm_guards(2);
        for guard in old {
            guard.retried();
            guard.fail();
        }
        assert_eq!(tracker.outstanding(), 2);
        assert!(!tracker.has_errors());
        assert!(!tracker.has_retries());
        for guard in fresh {
            guard.succeed();
        }
        assert!(tracker.is_done());
    }

    #[test]
    fn flags_freeze_once_done_but_errors_can_be_cleared() {
        let tracker = CompletionTracker::new();
        tracker.arm(1);
        tracker.mark_error();
        tracker.decrement().unwrap();
        tracker.mark_retry();
        assert!(!tracker.has_retries());
        assert!(tracker.has_errors());
        tracker.clear_errors();
        assert!(!tracker.has_errors());
    }
}
