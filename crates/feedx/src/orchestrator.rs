// ai
//! 🎼 The Feed Orchestrator: where the scorer, the cache, the coalescer and the live
//! subscriptions finally meet, shake hands, and produce something a human wants to scroll.
//!
//! 🎬 COLD OPEN: INT. DINING HALL. LUNCH RUSH.
//!
//! Three hundred students open the app at once. Each of them wants a different ordering.
//! Each of them follows different people. All of them are looking at roughly the same
//! fifty posts by roughly the same forty authors. The backing store would very much like
//! us to notice that last part. 🦆
//!
//! ## The flow
//!
//! ```text
//!   get_ranked_feed(viewer, mode)
//!        │
//!        ▼
//!   SubscriptionManager ── on_data ──▶ fan-out ──▶ raw channel (one per feed) ──▶ FeedWorker ──▶ caller
//!        │                                                                        │  parse · resolve authors (cache!) ·
//!        └── data_update ──▶ BatchCoalescer ◀──────────────────────────────────────┘  filter · score · order · sample
//! ```
//!
//! 🧠 Knowledge graph:
//! - Every feed uses the same live query key (collection + order + limit). The first feed
//!   opens it, later feeds attach to it, and the last [`FeedOrchestrator::stop_feed`] closes
//!   it. Each batch fans out to every attached feed, and a feed that attaches late gets the
//!   latest batch replayed so it does not wait for the next change.
//! - Cache, metrics and coalescer are shared by everything this orchestrator spawns, via
//!   [`FeedCore`]. One orchestrator per process, or one per test.
//! - Cache cleanup happens on the maintenance tick ([`FeedOrchestrator::spawn_maintenance`])
//!   or on demand ([`FeedOrchestrator::refresh_and_cleanup`]), never inline with a batch.
//! - Only failures of the primary live query reach the caller (as
//!   [`FeedUpdate::Disconnected`]). Analytics failures are logged and forgotten.

pub mod feed_worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{PointReader, SinkBackend, SourceBackend};
use crate::cache::BoundedCache;
use crate::clock::{Clock, SystemClock};
use crate::coalescer::{BatchCoalescer, PendingOperation};
use crate::common::{
    AuthorProfile, CollectionQuery, ContentItem, Direction, OrderingMode, Record, SubscriptionKey,
    ViewerContext,
};
use crate::debounce::Debouncer;
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::scoring::ScoreCalculator;
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::workers::Worker;
pub use feed_worker::{FeedUpdate, RankedItem};
use feed_worker::{FeedWorker, RawEvent};

/// 🗄️ Cache sizing and lifetimes, under `[cache]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(alias = "max_size")]
    pub capacity: usize,
    /// 👤 profiles churn slowly, so they live long
    pub profile_ttl_secs: u64,
    /// 📄 pages of posts churn fast, so they don't
    pub page_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            profile_ttl_secs: 30 * 60,
            page_ttl_secs: 2 * 60,
            cleanup_interval_secs: 5 * 60,
        }
    }
}

/// 📰 What the feed reads and how, under `[feed]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub collection: String,
    pub profile_collection: String,
    pub order_by_field: String,
    pub direction: Direction,
    pub limit: usize,
    /// 🎲 chance that an ordered batch also produces an algorithm-performance record
    pub analytics_sample_rate: f64,
    /// 🎲 chance, per scored post, of a per-post score breakdown record
    pub post_metrics_sample_rate: f64,
    pub fetch_time_samples: usize,
    /// ⏳ forced profile refreshes for one author within this window collapse into one
    pub refresh_debounce_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            collection: "posts".to_string(),
            profile_collection: "users".to_string(),
            order_by_field: "createdAt".to_string(),
            direction: Direction::Desc,
            limit: 50,
            analytics_sample_rate: 0.1,
            post_metrics_sample_rate: 0.05,
            fetch_time_samples: crate::metrics::DEFAULT_FETCH_TIME_SAMPLES,
            refresh_debounce_ms: 300,
        }
    }
}

impl FeedConfig {
    fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.collection.clone())
            .order_by(self.order_by_field.clone(), self.direction)
            .limit(self.limit)
    }
}

/// 🗃️ What the cache holds. Profiles may be cached as "known not to exist".
#[derive(Debug, Clone)]
pub(crate) enum CachedValue {
    Profile(Option<AuthorProfile>),
    Page(Vec<Record>),
}

/// 🧠 Everything shared between the orchestrator, its feed workers and its maintenance tick.
#[derive(Debug)]
pub(crate) struct FeedCore {
    pub(crate) feed_config: FeedConfig,
    cache_config: CacheConfig,
    pub(crate) scorer: ScoreCalculator,
    cache: BoundedCache<String, CachedValue>,
    metrics: MetricsRecorder,
    reader: Arc<SourceBackend>,
    pub(crate) coalescer: Arc<BatchCoalescer>,
    pub(crate) clock: Arc<dyn Clock>,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl FeedCore {
    /// 👤 Cache-or-fetch. `Ok(None)` means the user does not exist, and that's cached too.
    pub(crate) async fn fetch_author_profile(
        &self,
        author_id: &str,
        force_refresh: bool,
    ) -> Result<Option<AuthorProfile>> {
        let key = format!("user_{author_id}");
        if !force_refresh {
            if let Some(CachedValue::Profile(profile)) = self.cache.get(&key) {
                self.metrics.record_cache_hit();
                return Ok(profile);
            }
        }
        self.metrics.record_cache_miss();

        let started = Instant::now();
        let record = self
            .reader
            .get(&self.feed_config.profile_collection, author_id)
            .await
            .with_context(|| format!("💀 Looking up profile '{author_id}' in the backing store failed."))?;
        self.metrics.record_fetch_time(elapsed_ms(started));

        let profile = record.map(|record| AuthorProfile::from_record(author_id, &record));
        self.cache.set(
            key,
            CachedValue::Profile(profile.clone()),
            Duration::from_secs(self.cache_config.profile_ttl_secs),
        );
        Ok(profile)
    }

    /// 📄 One page of the feed collection, newest first by default. Cached briefly.
    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<ContentItem>> {
        let filter_part = filters
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let key = format!("{}_{page}_{page_size}_{filter_part}", self.feed_config.collection);

        let records = match self.cache.get(&key) {
            Some(CachedValue::Page(records)) => {
                self.metrics.record_cache_hit();
                records
            }
            _ => {
                self.metrics.record_cache_miss();
                let query = CollectionQuery {
                    order_by_field: self.feed_config.order_by_field.clone(),
                    direction: self.feed_config.direction,
                    limit: page_size,
                    offset: page.saturating_mul(page_size),
                    filters: filters.clone(),
                };
                let started = Instant::now();
                let records = self
                    .reader
                    .list(&self.feed_config.collection, &query)
                    .await
                    .with_context(|| format!("💀 Fetching page {page} of '{}' failed.", self.feed_config.collection))?;
                self.metrics.record_fetch_time(elapsed_ms(started));
                self.cache.set(
                    key,
                    CachedValue::Page(records.clone()),
                    Duration::from_secs(self.cache_config.page_ttl_secs),
                );
                records
            }
        };
        Ok(records.iter().filter_map(ContentItem::from_record).collect())
    }

    /// 📸 The recorder's numbers plus the cache size. Subscriptions are added by the orchestrator.
    pub(crate) fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_size: self.cache.size(),
            ..self.metrics.snapshot()
        }
    }

    /// 🧹 Purge expired cache entries, note the cleanup, flush pending analytics.
    async fn refresh_and_cleanup(&self) -> usize {
        let purged = self.cache.cleanup();
        self.metrics.record_cleanup(self.cache.size());
        self.coalescer.flush().await;
        let snapshot = self.metrics_snapshot();
        info!(
            "🧹 maintenance: purged {purged} cache entries, {} left, hit rate {:.1}%, avg fetch {:.2} ms",
            snapshot.cache_size,
            snapshot.cache_hit_rate * 100.0,
            snapshot.average_fetch_time_ms
        );
        purged
    }
}

/// 📺 A live, ordered feed. Read [`FeedUpdate`]s off `updates` until it closes.
#[derive(Debug)]
pub struct RankedFeed {
    pub updates: async_channel::Receiver<FeedUpdate>,
    pub mode: OrderingMode,
    feed_id: u64,
    updates_tx: async_channel::Sender<FeedUpdate>,
    cancelled: Arc<AtomicBool>,
}

/// 👆 What a viewer did to a post, as recorded by [`FeedOrchestrator::record_interaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    View,
    Scroll,
    Like,
    Comment,
    Share,
    Click,
}

/// 📡 The feeds attached to the shared live query, plus its latest result set.
#[derive(Debug, Default)]
struct FanOut {
    listeners: Vec<Listener>,
    latest: Option<Vec<Record>>,
}

#[derive(Debug)]
struct Listener {
    feed_id: u64,
    raw: async_channel::Sender<RawEvent>,
    updates: async_channel::Sender<FeedUpdate>,
}

impl FanOut {
    /// Feeds whose worker has exited are dropped on the way.
    fn deliver(&mut self, records: Vec<Record>) {
        self.listeners
            .retain(|listener| listener.raw.try_send(RawEvent::Batch(records.clone())).is_ok());
        self.latest = Some(records);
    }

    fn fail(&mut self, message: String) {
        self.listeners
            .retain(|listener| listener.raw.try_send(RawEvent::Error(message.clone())).is_ok());
    }

    /// 🧹 Detach every feed and close its update channel.
    fn close_all(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.updates.close();
        }
        self.latest = None;
    }
}

fn lock_fan_out(fan_out: &Mutex<FanOut>) -> MutexGuard<'_, FanOut> {
    fan_out.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 🎼 The caller-facing API of the ranking core.
#[derive(Debug)]
pub struct FeedOrchestrator {
    core: Arc<FeedCore>,
    subscriptions: SubscriptionManager,
    /// 🔒 the shared live query, held across open and close so attach and detach serialize
    live: tokio::sync::Mutex<Option<SubscriptionHandle>>,
    fan_out: Arc<Mutex<FanOut>>,
    next_feed_id: AtomicU64,
    refreshes: Debouncer,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl FeedOrchestrator {
    /// 🏗️ Wire an orchestrator around explicit collaborators. Starts the coalescer worker,
    /// so it must be called inside a tokio runtime.
    pub fn new(
        config: &AppConfig,
        source: SourceBackend,
        sink: SinkBackend,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .scoring
            .validate()
            .context("💀 Refusing to rank anything with these scoring weights.")?;

        let source = Arc::new(source);
        let coalescer = Arc::new(BatchCoalescer::start(&config.batching, sink));
        let core = FeedCore {
            feed_config: config.feed.clone(),
            cache_config: config.cache.clone(),
            scorer: ScoreCalculator::new(config.scoring.clone(), Arc::clone(&clock)),
            cache: BoundedCache::new(config.cache.capacity, Arc::clone(&clock)),
            metrics: MetricsRecorder::new(config.feed.fetch_time_samples, Arc::clone(&clock)),
            reader: Arc::clone(&source),
            coalescer: Arc::clone(&coalescer),
            clock: Arc::clone(&clock),
        };
        Ok(Self {
            core: Arc::new(core),
            subscriptions: SubscriptionManager::new(source, coalescer, clock),
            live: tokio::sync::Mutex::new(None),
            fan_out: Arc::new(Mutex::new(FanOut::default())),
            next_feed_id: AtomicU64::new(0),
            refreshes: Debouncer::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// 🏗️ Build the configured backends and an orchestrator on the wall clock.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let source = SourceBackend::from_config(&config.source_config)
            .await
            .context("💀 Could not set up the backing store.")?;
        let sink = SinkBackend::from_config(&config.sink_config)
            .await
            .context("💀 Could not set up the metrics sink.")?;
        Self::new(config, source, sink, Arc::new(SystemClock))
    }

    /// 📺 Open a live feed for `viewer`, ordered by `mode`.
    ///
    /// Feeds share one live query, so this opens it only if no feed has it open already.
    /// Fails only if the backing store will not open the live query.
    pub async fn get_ranked_feed(
        &self,
        viewer: Option<ViewerContext>,
        mode: OrderingMode,
    ) -> Result<RankedFeed> {
        let (raw_tx, raw_rx) = async_channel::unbounded();
        let (updates_tx, updates) = async_channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let feed_id = self.next_feed_id.fetch_add(1, Ordering::Relaxed);

        let mut live = self.live.lock().await;
        let reusable = match live.as_ref() {
            Some(handle) => self.subscriptions.is_active(handle).await,
            None => false,
        };
        if !reusable {
            lock_fan_out(&self.fan_out).latest = None;
            let data_fan_out = Arc::clone(&self.fan_out);
            let error_fan_out = Arc::clone(&self.fan_out);
            let handle = self
                .subscriptions
                .subscribe(
                    self.core.feed_config.subscription_key(),
                    Box::new(move |records| lock_fan_out(&data_fan_out).deliver(records)),
                    Box::new(move |message| lock_fan_out(&error_fan_out).fail(message)),
                )
                .await?;
            *live = Some(handle);
        }
        {
            let mut fan_out = lock_fan_out(&self.fan_out);
            if let Some(records) = fan_out.latest.clone() {
                let _ = raw_tx.try_send(RawEvent::Batch(records));
            }
            fan_out.listeners.push(Listener {
                feed_id,
                raw: raw_tx,
                updates: updates_tx.clone(),
            });
        }
        drop(live);

        // -- the worker ends when its raw channel closes, i.e. when it leaves the fan-out
        FeedWorker::new(
            Arc::clone(&self.core),
            raw_rx,
            updates_tx.clone(),
            viewer,
            mode,
            Arc::clone(&cancelled),
        )
        .start();

        debug!("📺 ranked feed {feed_id} opened ({mode}, {})", if reusable { "attached" } else { "new live query" });
        Ok(RankedFeed {
            updates,
            mode,
            feed_id,
            updates_tx,
            cancelled,
        })
    }

    /// 🔕 Stop a feed. No update is emitted for it after this returns, even if a batch was
    /// mid-flight (its profile lookups may still finish and warm the cache). The live query
    /// closes with the last feed. `false` if the feed was no longer attached.
    pub async fn stop_feed(&self, feed: &RankedFeed) -> bool {
        feed.cancelled.store(true, Ordering::SeqCst);
        feed.updates_tx.close();

        let mut live = self.live.lock().await;
        let (attached, nobody_left) = {
            let mut fan_out = lock_fan_out(&self.fan_out);
            let before = fan_out.listeners.len();
            fan_out.listeners.retain(|listener| listener.feed_id != feed.feed_id);
            (fan_out.listeners.len() < before, fan_out.listeners.is_empty())
        };
        if nobody_left {
            if let Some(handle) = live.take() {
                self.subscriptions.unsubscribe(&handle).await;
                debug!("🔕 last feed stopped, live query closed");
            }
            lock_fan_out(&self.fan_out).latest = None;
        }
        attached
    }

    /// 👆 Note that `viewer_id` did something to `item_id`. Goes through the coalescer like
    /// every other analytics record. `false` if the coalescer had no room for it.
    pub fn record_interaction(
        &self,
        viewer_id: &str,
        kind: InteractionKind,
        item_id: &str,
        metadata: Value,
    ) -> bool {
        self.core.coalescer.add(PendingOperation::new(
            "feed_interaction",
            json!({
                "viewer_id": viewer_id,
                "interaction_type": kind,
                "post_id": item_id,
                "metadata": metadata,
                "timestamp": self.core.clock.now().timestamp_millis(),
            }),
        ))
    }

    /// ⏳ Force-refresh one author's profile, `refresh_debounce_ms` after the last call for
    /// that author. A burst of calls costs one read.
    pub fn schedule_profile_refresh(&self, author_id: &str) {
        let core = Arc::clone(&self.core);
        let author = author_id.to_string();
        let delay = Duration::from_millis(self.core.feed_config.refresh_debounce_ms);
        self.refreshes.schedule(format!("user_{author_id}"), delay, async move {
            if let Err(err) = core.fetch_author_profile(&author, true).await {
                warn!("⚠️ debounced refresh of profile '{author}' failed: {err:#}");
            }
        });
    }

    /// 👤 Cache-or-fetch one author profile. `force_refresh` skips the cache read.
    pub async fn fetch_author_profile(
        &self,
        author_id: &str,
        force_refresh: bool,
    ) -> Result<Option<AuthorProfile>> {
        self.core.fetch_author_profile(author_id, force_refresh).await
    }

    /// 📄 One-shot paginated read (page numbers start at 0), with equality filters.
    pub async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<ContentItem>> {
        self.core.fetch_page(page, page_size, filters).await
    }

    /// 👀 Build a viewer context from the profile collection. Unknown ids get a bare viewer.
    pub async fn viewer_context(&self, viewer_id: &str) -> Result<ViewerContext> {
        let record = self
            .core
            .reader
            .get(&self.core.feed_config.profile_collection, viewer_id)
            .await
            .with_context(|| format!("💀 Could not load viewer '{viewer_id}'."))?;
        Ok(record
            .map(|record| ViewerContext::from_record(viewer_id, &record))
            .unwrap_or_else(|| ViewerContext::new(viewer_id)))
    }

    pub async fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_subscriptions: self.subscriptions.active_count().await,
            ..self.core.metrics_snapshot()
        }
    }

    /// 🧹 Manual maintenance: purge expired cache entries and flush analytics.
    /// Returns how many cache entries were purged.
    pub async fn refresh_and_cleanup(&self) -> usize {
        self.core.refresh_and_cleanup().await
    }

    /// ⏲️ Run [`refresh_and_cleanup`](Self::refresh_and_cleanup) every `cleanup_interval_secs`.
    /// Calling it again restarts the timer.
    pub fn spawn_maintenance(&self) {
        let core = Arc::clone(&self.core);
        let period = Duration::from_secs(self.core.cache_config.cleanup_interval_secs.max(1));
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // -- the first tick fires immediately, and a fresh cache has nothing to purge
            interval.tick().await;
            loop {
                interval.tick().await;
                core.refresh_and_cleanup().await;
            }
        });

        let previous = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tick);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// 🏁 Tear everything down: maintenance, pending refreshes, subscriptions and feeds, then
    /// a final analytics flush.
    pub async fn shutdown(&self) -> Result<()> {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(maintenance) = maintenance {
            maintenance.abort();
        }
        self.refreshes.cancel_all();
        let mut live = self.live.lock().await;
        let torn_down = self.subscriptions.cleanup_all().await;
        live.take();
        lock_fan_out(&self.fan_out).close_all();
        drop(live);
        self.core.coalescer.shutdown().await?;
        self.core.cache.clear();
        info!("🏁 orchestrator shut down ({torn_down} subscriptions closed)");
        Ok(())
    }
}
