// ai
//! ⏳ Trailing-edge debounce, per key.
//!
//! 🎬 A profile screen fires "refresh this author" on every keystroke, every focus, every
//! pull. Only the last one in a burst should ever reach the backing store.
//!
//! Each key owns at most one pending task. Scheduling again for the same key aborts the
//! pending one and starts the wait over, so the work runs once, `delay` after the last call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ⏳ Run `work` after `delay`, unless this key is scheduled again first.
    /// Must be called inside a tokio runtime.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        });

        let mut pending = self.pending();
        pending.retain(|_, task| !task.is_finished());
        if let Some(previous) = pending.insert(key.clone(), task) {
            trace!("⏳ debounce: restarting the wait for {key}");
            previous.abort();
        }
    }

    /// 📏 Keys with work still waiting (or running).
    pub fn pending_count(&self) -> usize {
        self.pending().values().filter(|task| !task.is_finished()).count()
    }

    /// 🧹 Drop every pending call. Work already past its wait may be cut off mid-flight.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending();
        let live = pending.values().filter(|task| !task.is_finished()).count();
        for (_, task) in pending.drain() {
            task.abort();
        }
        live
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_burst_runs_once_after_the_last_call() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(300);

        for _ in 0..3 {
            debouncer.schedule("user_fran", delay, counting(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0, "still inside the window of the last call");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_keys_do_not_cancel_each_other() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        debouncer.schedule("user_fran", Duration::from_millis(300), counting(&runs));
        debouncer.schedule("user_sam", Duration::from_millis(300), counting(&runs));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_cancel_all_means_nothing_runs() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        debouncer.schedule("user_fran", Duration::from_millis(300), counting(&runs));
        assert_eq!(debouncer.pending_count(), 1);

        assert_eq!(debouncer.cancel_all(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending_count(), 0);
    }
}
