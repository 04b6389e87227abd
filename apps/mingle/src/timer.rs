//! Cancellable one-shot timers shared by the reconnect scheduler and the
//! notification/typing expiry paths.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a scheduled task. Dropping the handle does not cancel the task;
/// call [`TimerHandle::cancel`].
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Marks the timer cancelled and aborts its task. A task that already woke
    /// up observes the flag before running its body.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `task` after `delay` unless the returned handle is cancelled first.
pub fn schedule<F, Fut>(delay: Duration, task: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if flag.load(Ordering::SeqCst) {
            return;
        }
        task().await;
    });
    TimerHandle { cancelled, task }
}

/// `base * 2^attempt`, saturating instead of overflowing.
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    match 1u32.checked_shl(attempt) {
        Some(factor) => base.saturating_mul(factor),
        None => Duration::MAX,
    }
}

/// `base * attempt`, with attempt numbering starting at one.
pub fn linear_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn exponential_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(exponential_backoff(base, 0), Duration::from_millis(100));
        assert_eq!(exponential_backoff(base, 1), Duration::from_millis(200));
        assert_eq!(exponential_backoff(base, 3), Duration::from_millis(800));
        assert_eq!(exponential_backoff(base, 64), Duration::MAX);
    }

    #[test]
    fn linear_grows_by_base() {
        let base = Duration::from_secs(1);
        assert_eq!(linear_backoff(base, 0), Duration::from_secs(1));
        assert_eq!(linear_backoff(base, 1), Duration::from_secs(1));
        assert_eq!(linear_backoff(base, 4), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = {
            let hits = hits.clone();
            schedule(Duration::from_secs(2), move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = {
            let hits = hits.clone();
            schedule(Duration::from_secs(2), move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
