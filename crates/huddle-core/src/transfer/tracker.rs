//! Per-request thread completion join.

use std::collections::BTreeSet;
use tokio::sync::watch;

/// Outcome of waiting on a tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutcome {
    /// Every thread reported completion
    Completed,
    /// A thread failed; the whole request is aborted
    Failed(String),
    /// The tracker was released before resolving
    Released,
}

#[derive(Debug, Default)]
struct TrackerState {
    completed: BTreeSet<usize>,
    failure: Option<String>,
    released: bool,
}

/// Join over the threads of one transfer
///
/// Resolves exactly when every index in `0..threads` has reported completion.
/// The first failure rejects it; later reports are ignored.
#[derive(Debug)]
pub struct ThreadCompletionTracker {
    threads: usize,
    state: watch::Sender<TrackerState>,
}

impl ThreadCompletionTracker {
    /// Create a tracker for `threads` threads
    pub fn new(threads: usize) -> Self {
        let (state, _) = watch::channel(TrackerState::default());
        Self { threads, state }
    }

    /// Total thread count
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of threads reported complete
    pub fn completed(&self) -> usize {
        self.state.borrow().completed.len()
    }

    /// Threads not yet reported complete, in index order
    pub fn pending(&self) -> Vec<usize> {
        let state = self.state.borrow();
        (0..self.threads)
            .filter(|index| !state.completed.contains(index))
            .collect()
    }

    /// Record completion of thread `index`
    ///
    /// Returns `true` if this call completed the whole set.
    pub fn complete(&self, index: usize) -> bool {
        if index >= self.threads {
            tracing::warn!(
                "Completion for thread {} outside 0..{}",
                index,
                self.threads
            );
            return false;
        }
        let threads = self.threads;
        let mut finished = false;
        self.state.send_modify(|state| {
            if state.failure.is_none() && state.completed.insert(index) {
                finished = state.completed.len() == threads;
            }
        });
        finished
    }

    /// Reject the join
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_modify(|state| {
            if state.failure.is_none() {
                state.failure = Some(reason);
            }
        });
    }

    /// Resolve any waiter without an outcome
    pub fn release(&self) {
        self.state.send_modify(|state| state.released = true);
    }

    /// Wait until the join resolves
    pub async fn wait(&self) -> TrackerOutcome {
        let threads = self.threads;
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|state| {
                state.released || state.failure.is_some() || state.completed.len() == threads
            })
            .await;

        match result {
            Ok(state) => Self::outcome(&state, threads),
            Err(_) => TrackerOutcome::Released,
        }
    }

    fn outcome(state: &TrackerState, threads: usize) -> TrackerOutcome {
        if let Some(reason) = &state.failure {
            TrackerOutcome::Failed(reason.clone())
        } else if state.completed.len() == threads {
            TrackerOutcome::Completed
        } else {
            TrackerOutcome::Released
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_after_all_threads() {
        let tracker = Arc::new(ThreadCompletionTracker::new(3));
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait().await })
        };

        assert!(!tracker.complete(2));
        assert!(!tracker.complete(0));
        // duplicate reports count once
        assert!(!tracker.complete(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(tracker.complete(1));
        assert_eq!(waiter.await.unwrap(), TrackerOutcome::Completed);
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let tracker = ThreadCompletionTracker::new(4);
        tracker.complete(0);
        tracker.fail("thread 1: disk full");
        tracker.fail("thread 2: later");
        assert!(!tracker.complete(1));

        assert_eq!(
            tracker.wait().await,
            TrackerOutcome::Failed("thread 1: disk full".into())
        );
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let tracker = Arc::new(ThreadCompletionTracker::new(2));
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait().await })
        };
        tracker.release();
        assert_eq!(waiter.await.unwrap(), TrackerOutcome::Released);
    }

    #[test]
    fn test_pending_lists_missing_threads() {
        let tracker = ThreadCompletionTracker::new(4);
        tracker.complete(1);
        tracker.complete(3);
        assert_eq!(tracker.pending(), vec![0, 2]);
        tracker.complete(0);
        tracker.complete(2);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_out_of_range_ignored() {
        let tracker = ThreadCompletionTracker::new(1);
        assert!(!tracker.complete(5));
        assert_eq!(tracker.completed(), 0);
        assert!(tracker.complete(0));
    }
}
