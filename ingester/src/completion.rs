//! A minimal completion signal: the only future semantics the engine needs
//! are "wait with a timeout", "cancel", and "is it done".

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    outcome: Option<Result<i64, String>>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<SignalState>,
    notify: Notify,
}

/// Result of waiting on a [`CompletionSignal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// Completed with the offset the record landed at (`-1` when the signal
    /// carries no offset).
    Completed(i64),
    /// The operation behind the signal failed.
    Failed(String),
    /// The signal was cancelled before completing.
    Cancelled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Shared completion signal. Clones observe the same state; the first
/// completion wins.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

impl CompletionSignal {
    /// A fresh, pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete successfully with `offset`.
    pub fn complete(&self, offset: i64) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() && !state.cancelled {
            state.outcome = Some(Ok(offset));
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Complete with a failure.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() && !state.cancelled {
            state.outcome = Some(Err(message.into()));
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Cancel the signal; pending and future waiters observe
    /// [`WaitResult::Cancelled`] unless the signal already completed.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.cancelled = true;
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether the signal completed, failed or was cancelled.
    pub fn is_done(&self) -> bool {
        let state = self.inner.state.lock();
        state.outcome.is_some() || state.cancelled
    }

    fn snapshot(&self) -> Option<WaitResult> {
        let state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Some(match outcome {
                Ok(offset) => WaitResult::Completed(*offset),
                Err(message) => WaitResult::Failed(message.clone()),
            });
        }
        if state.cancelled {
            return Some(WaitResult::Cancelled);
        }
        None
    }

    /// Wait for completion, up to `timeout`.
    pub async fn wait(&self, timeout: Duration) -> WaitResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            if let Some(result) = self.snapshot() {
                return result;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return WaitResult::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_done());

        signal.complete(42);
        signal.complete(43);
        assert!(signal.is_done());
        assert_eq!(
            signal.wait(Duration::from_millis(10)).await,
            WaitResult::Completed(42)
        );
    }

    #[tokio::test]
    async fn failure_propagates() {
        let signal = CompletionSignal::new();
        signal.fail("send failed");
        assert_eq!(
            signal.wait(Duration::from_millis(10)).await,
            WaitResult::Failed("send failed".to_string())
        );
    }

    #[tokio::test]
    async fn wait_times_out() {
        let signal = CompletionSignal::new();
        assert_eq!(
            signal.wait(Duration::from_millis(10)).await,
            WaitResult::TimedOut
        );
    }

    #[tokio::test]
    async fn cancellation_sticks() {
        let signal = CompletionSignal::new();
        signal.cancel();
        signal.complete(7);
        assert_eq!(
            signal.wait(Duration::from_millis(10)).await,
            WaitResult::Cancelled
        );
    }

    #[tokio::test]
    async fn waiter_wakes_on_completion() {
        let signal = CompletionSignal::new();
        let waiter = signal.clone();
        let handle =
            tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        signal.complete(3);
        assert_eq!(handle.await.unwrap(), WaitResult::Completed(3));
    }
}
