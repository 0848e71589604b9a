// ai
//! 🔔 The Subscription Manager: at most one live query per key, and a real off switch.
//!
//! 🎬 COLD OPEN: INT. LECTURE HALL. A student taps "Most liked", then "Recent", then
//! "Most liked" again, in under a second. Three live queries open. Two of them keep firing
//! into a screen that no longer exists. The phone gets warm. The battery gets sad.
//!
//! Not here. Each [`SubscriptionKey`] maps to at most one running subscription. Subscribing
//! with a key that is already active tears the old one down first (and waits for it to be
//! fully gone) before the new one opens.
//!
//! Every subscription runs in its own task, which owns the `on_data` / `on_error` callbacks.
//! [`SubscriptionManager::unsubscribe`] signals that task to stop and awaits its
//! `JoinHandle`. Once the await completes the task no longer exists, so neither do any
//! callbacks. That's the whole cancellation story. 🦆
//!
//! The manager does no business logic. It multiplexes, de-duplicates, and drops a
//! `data_update` note into the coalescer for every batch it forwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backends::{LiveSource, SourceBackend, SourceEvent};
use crate::clock::Clock;
use crate::coalescer::{BatchCoalescer, PendingOperation};
use crate::common::{Record, SubscriptionKey};

/// 📬 Called with the full result set every time the backing store reports a change.
pub type DataHandler = Box<dyn FnMut(Vec<Record>) + Send + 'static>;
/// 💥 Called when the backing store reports a failure on this subscription.
pub type ErrorHandler = Box<dyn FnMut(String) + Send + 'static>;

/// 🎟️ Proof that you subscribed. Hand it back to unsubscribe.
///
/// Carries a generation number, so a handle to a subscription that has since been replaced
/// can't tear down its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

#[derive(Debug)]
struct ActiveSubscription {
    generation: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    /// 🛑 Active → Terminated. Returns once the task (and its callbacks) are gone.
    async fn terminate(self, key: &SubscriptionKey) {
        // -- the task may have ended on its own already, in which case nobody hears this
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!("💀 subscription task for {} panicked: {err}", key.signature());
            }
        }
    }
}

/// 🔔 Owns the table of live subscriptions.
#[derive(Debug)]
pub struct SubscriptionManager {
    source: Arc<SourceBackend>,
    coalescer: Arc<BatchCoalescer>,
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        source: Arc<SourceBackend>,
        coalescer: Arc<BatchCoalescer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            coalescer,
            clock,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// 🔔 Open a live subscription for `key`, replacing any active one with the same key.
    ///
    /// Fails only if the backing store refuses to open the query.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        on_data: DataHandler,
        on_error: ErrorHandler,
    ) -> Result<SubscriptionHandle> {
        // -- 🔒 held for the whole swap, so two racing subscribes to one key serialize
        let mut active = self.active.lock().await;
        if let Some(previous) = active.remove(&key) {
            debug!("♻️ replacing active subscription for {}", key.signature());
            previous.terminate(&key).await;
        }

        let stream = self
            .source
            .open(&key)
            .await
            .with_context(|| format!("💀 The backing store would not open a live query for {}.", key.signature()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            key.clone(),
            stream.id,
            stream.events,
            stop_rx,
            on_data,
            on_error,
            Arc::clone(&self.source),
            Arc::clone(&self.coalescer),
            Arc::clone(&self.clock),
        ));

        active.insert(
            key.clone(),
            ActiveSubscription {
                generation,
                stop,
                task,
            },
        );
        debug!("🔔 subscribed to {} (generation {generation})", key.signature());
        Ok(SubscriptionHandle { key, generation })
    }

    /// 🔕 Tear the subscription down. `false` if it was already gone or has been replaced.
    ///
    /// After this returns, the handle's callbacks will never be called again.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut active = self.active.lock().await;
        let is_current = active
            .get(&handle.key)
            .is_some_and(|subscription| subscription.generation == handle.generation);
        if !is_current {
            return false;
        }
        if let Some(subscription) = active.remove(&handle.key) {
            subscription.terminate(&handle.key).await;
        }
        debug!("🔕 unsubscribed from {}", handle.key.signature());
        true
    }

    /// 🔎 Is this handle still the live subscription for its key, with its task running?
    pub async fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.active.lock().await.get(&handle.key).is_some_and(|subscription| {
            subscription.generation == handle.generation && !subscription.task.is_finished()
        })
    }

    /// 🧹 Tear down every subscription. Sign-out and shutdown both end up here.
    pub async fn cleanup_all(&self) -> usize {
        let mut active = self.active.lock().await;
        let count = active.len();
        for (key, subscription) in active.drain() {
            subscription.terminate(&key).await;
        }
        if count > 0 {
            debug!("🧹 tore down {count} subscriptions");
        }
        count
    }

    /// 📏 Subscriptions whose task is still running.
    pub async fn active_count(&self) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|subscription| !subscription.task.is_finished())
            .count()
    }
}

/// 🔁 The body of one subscription task. Owns the callbacks until it returns.
#[allow(clippy::too_many_arguments)]
async fn run_subscription(
    key: SubscriptionKey,
    stream_id: u64,
    events: async_channel::Receiver<SourceEvent>,
    mut stop: oneshot::Receiver<()>,
    mut on_data: DataHandler,
    mut on_error: ErrorHandler,
    source: Arc<SourceBackend>,
    coalescer: Arc<BatchCoalescer>,
    clock: Arc<dyn Clock>,
) {
    loop {
        tokio::select! {
            // -- 🛑 a pending stop beats a pending batch
            biased;
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(SourceEvent::Batch(records)) => {
                    coalescer.add(PendingOperation::new(
                        "data_update",
                        json!({
                            "collection": key.collection,
                            "subscription": key.signature(),
                            "count": records.len(),
                            "timestamp": clock.now().timestamp_millis(),
                        }),
                    ));
                    on_data(records);
                }
                Ok(SourceEvent::Error(message)) => {
                    error!("💥 live query {} failed: {message}", key.signature());
                    on_error(message);
                }
                Err(_) => {
                    warn!("🔌 the backing store closed the live query for {}", key.signature());
                    on_error(format!("live query for {} was closed by the backing store", key.signature()));
                    break;
                }
            },
        }
    }

    if let Err(err) = source.close(stream_id).await {
        warn!("🔌 closing stream {stream_id} for {} failed: {err:#}", key.signature());
    }
}
