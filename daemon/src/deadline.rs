//! Caller cancellation and deadline intersection.
//!
//! A job's deadline is the first of two independent signals: the submitter
//! cancelling (for the gateway, the client going away) and the queue's fixed
//! upper bound elapsing.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Create a linked guard/signal pair.
///
/// The signal fires when the guard is cancelled or dropped.
pub fn cancel_pair() -> (CancelGuard, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelGuard { tx }, CancelSignal { rx: Some(rx) })
}

/// Owning side of a caller cancellation. Dropping it cancels.
#[derive(Debug)]
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

/// Observing side of a caller cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub const fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the caller has cancelled.
    pub async fn cancelled(&mut self) {
        match self.rx.as_mut() {
            // A closed channel means the guard is gone, which counts as cancelled.
            Some(rx) => {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Which bound ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineCause {
    CallerCancelled,
    LimitElapsed,
}

impl fmt::Display for DeadlineCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallerCancelled => f.write_str("caller cancelled"),
            Self::LimitElapsed => f.write_str("execution time limit elapsed"),
        }
    }
}

/// Intersection of a caller's cancellation signal and a fixed time limit.
#[derive(Debug)]
pub struct Deadline {
    caller: CancelSignal,
    limit: Duration,
    expires_at: Instant,
}

impl Deadline {
    /// Start the clock now.
    pub fn new(caller: CancelSignal, limit: Duration) -> Self {
        Self {
            caller,
            limit,
            expires_at: Instant::now() + limit,
        }
    }

    pub const fn limit(&self) -> Duration {
        self.limit
    }

    /// Non-blocking check, caller cancellation first.
    pub fn check(&self) -> Option<DeadlineCause> {
        if self.caller.is_cancelled() {
            Some(DeadlineCause::CallerCancelled)
        } else if Instant::now() >= self.expires_at {
            Some(DeadlineCause::LimitElapsed)
        } else {
            None
        }
    }

    /// Resolve with whichever bound fires first.
    pub async fn expired(&mut self) -> DeadlineCause {
        if let Some(cause) = self.check() {
            return cause;
        }
        tokio::select! {
            biased;
            () = self.caller.cancelled() => DeadlineCause::CallerCancelled,
            () = tokio::time::sleep_until(self.expires_at) => DeadlineCause::LimitElapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn signal_fires_on_cancel() {
        let (guard, signal) = cancel_pair();
        let mut observer = signal.clone();
        let mut fut = task::spawn(async move { observer.cancelled().await });
        assert_pending!(fut.poll());
        assert!(!signal.is_cancelled());

        guard.cancel();
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn dropping_guard_cancels() {
        let (guard, signal) = cancel_pair();
        drop(guard);
        assert!(signal.is_cancelled());
    }

    #[test]
    fn never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let mut fut = task::spawn(async move { signal.cancelled().await });
        assert_pending!(fut.poll());
    }

    #[tokio::test]
    async fn limit_fires_without_caller() {
        let mut deadline = Deadline::new(CancelSignal::never(), Duration::from_millis(20));
        assert_eq!(deadline.check(), None);
        assert_eq!(deadline.expired().await, DeadlineCause::LimitElapsed);
        assert_eq!(deadline.check(), Some(DeadlineCause::LimitElapsed));
    }

    #[tokio::test]
    async fn caller_fires_before_limit() {
        let (guard, signal) = cancel_pair();
        let mut deadline = Deadline::new(signal, Duration::from_secs(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            guard.cancel();
        });

        let cause = tokio::time::timeout(Duration::from_secs(5), deadline.expired())
            .await
            .expect("caller cancellation should end the deadline");
        assert_eq!(cause, DeadlineCause::CallerCancelled);
    }

    #[tokio::test]
    async fn already_cancelled_caller_wins_immediately() {
        let (guard, signal) = cancel_pair();
        guard.cancel();
        let mut deadline = Deadline::new(signal, Duration::ZERO);
        assert_eq!(deadline.expired().await, DeadlineCause::CallerCancelled);
    }
}
