//! Cancellable one-shot timers.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// A callback scheduled to run once after a delay.
///
/// Cancelling is idempotent: it is safe on a handle that already fired,
/// was already cancelled, or never held a timer. Dropping cancels.
#[derive(Debug, Default)]
pub struct ScheduledCallback {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledCallback {
    /// A handle with nothing scheduled.
    pub fn none() -> Self {
        Self { handle: None }
    }

    /// Run `callback` after `delay` on the current tokio runtime.
    ///
    /// Outside a runtime nothing is scheduled and the callback never runs.
    pub fn schedule<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(delay_ms = delay.as_millis() as u64, "No tokio runtime, timer not scheduled");
            return Self::none();
        };
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True while the callback has neither run nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ScheduledCallback {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (count, callback) = counter();
        let timer = ScheduledCallback::schedule(Duration::from_millis(1000), callback);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire() {
        let (count, callback) = counter();
        let mut timer = ScheduledCallback::schedule(Duration::from_millis(100), callback);

        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_noop() {
        let (count, callback) = counter();
        let mut timer = ScheduledCallback::schedule(Duration::from_millis(10), callback);

        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_outside_runtime_does_nothing() {
        let (count, callback) = counter();
        let timer = ScheduledCallback::schedule(Duration::from_millis(1), callback);

        assert!(!timer.is_pending());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn none_is_not_pending() {
        let mut timer = ScheduledCallback::none();
        assert!(!timer.is_pending());
        timer.cancel();
    }
}
