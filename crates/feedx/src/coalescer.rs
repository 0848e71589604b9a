// ai
//! 🎬 *[forty analytics events arrive in one second. the metrics sink charges per request.]*
//! *[the clock on the wall reads 2:47am.]*
//! *[someone suggests batching. everyone pretends it was their idea.]*
//!
//! 📦 The Batch Coalescer: many small writes in, few grouped writes out.
//!
//! Producers call [`BatchCoalescer::add`] from anywhere, sync or async. It never blocks:
//! the operation goes into a bounded channel, and if that channel is full the operation is
//! dropped with a warning, because analytics are best-effort and the ranking path is not.
//!
//! One worker task owns every per-kind queue. A kind is flushed when its queue reaches
//! `batch_size`, or when its oldest operation has waited `batch_timeout`, whichever comes
//! first. Since only the worker touches the queues, the size trigger and the timer trigger
//! can't both flush the same group: the queue is removed from the map before the sink is
//! awaited, and whatever arrives after that starts a fresh group.
//!
//! 🦆 Within a kind, FIFO. Across kinds, no promises.
//!
//! ⚠️ A failed sink write is logged and the group is gone. No retry, no re-enqueue.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::backends::{MetricsSink, SinkBackend};
use crate::workers::Worker;

/// 🔧 Batching knobs, under `[batching]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// how many operations may wait in the channel before `add` starts dropping them
    #[serde(alias = "channel_size")]
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 100,
            queue_capacity: 1024,
        }
    }
}

/// 📨 One pending write: which kind of analytics record it is, and the record itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub kind: String,
    pub record: Value,
}

impl PendingOperation {
    pub fn new(kind: impl Into<String>, record: Value) -> Self {
        Self {
            kind: kind.into(),
            record,
        }
    }
}

#[derive(Debug)]
enum Command {
    Add(PendingOperation),
    /// flush everything now, then say so
    Flush(oneshot::Sender<()>),
}

/// 📦 Handle to the coalescer. Share it behind an `Arc`.
#[derive(Debug)]
pub struct BatchCoalescer {
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl BatchCoalescer {
    /// 🚀 Spawn the worker and hand back the producer side. Needs a tokio runtime.
    pub fn start(config: &BatchConfig, sink: SinkBackend) -> Self {
        let (tx, rx) = async_channel::bounded(config.queue_capacity.max(1));
        let worker = CoalescerWorker::new(rx, sink, config).start();
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// 📥 Queue an operation. Returns `false` if it was dropped (queue full or shut down).
    pub fn add(&self, operation: PendingOperation) -> bool {
        match self.tx.try_send(Command::Add(operation)) {
            Ok(()) => true,
            Err(TrySendError::Full(Command::Add(operation))) => {
                warn!(
                    "🚧 coalescer queue is full, dropping a '{}' operation on the floor",
                    operation.kind
                );
                false
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                warn!("🚪 coalescer is shut down, operation dropped");
                false
            }
        }
    }

    /// 🚽 Flush every queued kind now and wait until the sink has been called for each.
    ///
    /// Operations added before this call are included. A flush with nothing queued does nothing.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_err() {
            trace!("🚪 flush requested after shutdown, nothing to do");
            return;
        }
        let _ = ack_rx.await;
    }

    /// 🏁 Stop accepting operations, flush what's left, wait for the worker to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker
                .await
                .context("💀 The coalescer worker panicked on its way out.")??;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct KindQueue {
    records: Vec<Value>,
    /// when the oldest record in this queue arrived
    oldest: Instant,
}

/// 🗑️ Drains commands, groups them by kind, decides when to flush.
#[derive(Debug)]
struct CoalescerWorker {
    rx: Receiver<Command>,
    sink: SinkBackend,
    batch_size: usize,
    batch_timeout: Duration,
    queues: HashMap<String, KindQueue>,
}

impl CoalescerWorker {
    fn new(rx: Receiver<Command>, sink: SinkBackend, config: &BatchConfig) -> Self {
        Self {
            rx,
            sink,
            batch_size: config.batch_size.max(1),
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            queues: HashMap::new(),
        }
    }

    /// Earliest instant at which some queue becomes due.
    fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .map(|queue| queue.oldest + self.batch_timeout)
            .min()
    }

    /// Queue the operation. Returns the kind if that queue just hit `batch_size`.
    fn enqueue(&mut self, operation: PendingOperation) -> Option<String> {
        let queue = self
            .queues
            .entry(operation.kind.clone())
            .or_insert_with(|| KindQueue {
                records: Vec::with_capacity(self.batch_size),
                oldest: Instant::now(),
            });
        queue.records.push(operation.record);
        (queue.records.len() >= self.batch_size).then_some(operation.kind)
    }

    async fn flush_kind(&mut self, kind: &str) {
        // -- ✂️ take the group out first. anything added during the await starts a new group.
        let Some(queue) = self.queues.remove(kind) else {
            return;
        };
        let count = queue.records.len();
        match self.sink.write_batch(kind, queue.records).await {
            Ok(()) => debug!("📤 flushed {count} '{kind}' operations"),
            Err(err) => warn!("📉 metrics sink rejected {count} '{kind}' operations: {err:#}"),
        }
    }

    async fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.oldest + self.batch_timeout <= now)
            .map(|(kind, _)| kind.clone())
            .collect();
        for kind in due {
            self.flush_kind(&kind).await;
        }
    }

    async fn flush_all(&mut self) {
        let kinds: Vec<String> = self.queues.keys().cloned().collect();
        for kind in kinds {
            self.flush_kind(&kind).await;
        }
    }
}

impl Worker for CoalescerWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 coalescer worker started");
            loop {
                let deadline = self.next_deadline();
                let timer = async move {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    command = self.rx.recv() => match command {
                        Ok(Command::Add(operation)) => {
                            if let Some(kind) = self.enqueue(operation) {
                                self.flush_kind(&kind).await;
                            }
                        }
                        Ok(Command::Flush(ack)) => {
                            self.flush_all().await;
                            let _ = ack.send(());
                        }
                        Err(_) => {
                            // -- channel closed and drained
                            self.flush_all().await;
                            debug!("🏁 coalescer worker: channel closed, final flush done");
                            return Ok(());
                        }
                    },
                    () = timer => self.flush_due().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryMetricsSink;
    use serde_json::json;

    fn coalescer(batch_size: usize) -> (BatchCoalescer, InMemoryMetricsSink) {
        let sink = InMemoryMetricsSink::new();
        let config = BatchConfig {
            batch_size,
            batch_timeout_ms: 100,
            queue_capacity: 64,
        };
        (
            BatchCoalescer::start(&config, SinkBackend::InMemory(sink.clone())),
            sink,
        )
    }

    fn op(kind: &str, n: u64) -> PendingOperation {
        PendingOperation::new(kind, json!({ "n": n }))
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_full_batch_flushes_exactly_once_in_order() {
        let (coalescer, sink) = coalescer(10);
        for n in 0..10 {
            assert!(coalescer.add(op("fetch_time", n)));
        }
        // -- the explicit flush is a barrier here: the size trigger already emptied the queue
        coalescer.flush().await;

        let batches = sink.batches().await;
        assert_eq!(batches.len(), 1, "one flush, not two");
        let (kind, records) = &batches[0];
        assert_eq!(kind, "fetch_time");
        let order: Vec<u64> = records.iter().filter_map(|r| r["n"].as_u64()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_small_batch_waits_for_the_timer() {
        let (coalescer, sink) = coalescer(10);
        for n in 0..3 {
            coalescer.add(op("data_update", n));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.batches().await.is_empty(), "too early to flush");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let batches = sink.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.batches().await.len(), 1, "and exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_flushing_nothing_does_nothing() -> Result<()> {
        let (coalescer, sink) = coalescer(10);
        coalescer.flush().await;
        coalescer.flush().await;
        coalescer.shutdown().await?;
        assert!(sink.batches().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_kinds_keep_to_themselves() {
        let (coalescer, sink) = coalescer(2);
        coalescer.add(op("a", 1));
        coalescer.add(op("b", 1));
        coalescer.add(op("a", 2));
        coalescer.flush().await;

        let batches = sink.batches().await;
        assert_eq!(batches[0].0, "a", "a filled up first");
        assert_eq!(batches[0].1.len(), 2);
        assert_eq!(batches[1].0, "b", "b only left when asked to");
        assert_eq!(batches[1].1.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_broken_sink_does_not_break_the_coalescer() {
        let (coalescer, sink) = coalescer(2);
        sink.set_failing(true);
        coalescer.add(op("fetch_time", 1));
        coalescer.add(op("fetch_time", 2));
        coalescer.flush().await;
        assert!(sink.batches().await.is_empty());

        sink.set_failing(false);
        coalescer.add(op("fetch_time", 3));
        coalescer.flush().await;
        let batches = sink.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![json!({ "n": 3 })], "the failed group is not re-enqueued");
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_shutdown_flushes_the_leftovers_and_closes_the_door() -> Result<()> {
        let (coalescer, sink) = coalescer(10);
        coalescer.add(op("algorithm_performance", 1));
        coalescer.shutdown().await?;

        assert_eq!(sink.batches().await.len(), 1);
        assert!(!coalescer.add(op("algorithm_performance", 2)), "closed for business");
        Ok(())
    }
}
