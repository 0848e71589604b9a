// ai
//! 📊 metrics.rs: "is the feed fast?" asked every product review, every sprint, forever.
//!
//! 🚀 The Metrics Recorder keeps the last N fetch latencies in a ring buffer, counts cache
//! hits and misses, and hands out a [`MetricsSnapshot`] on demand. It also knows how to
//! draw itself as a table, because "cache_hit_rate: 0.8333333333" is a war crime in a terminal.
//!
//! ⚠️ Watching the hit rate will not make it go up. We've tried. Science says no.
//!
//! 🧠 Knowledge graph:
//! - One recorder per process, shared via `Arc` by the orchestrator and everything it spawns.
//!   Constructed explicitly so tests get their own isolated instance.
//! - One coarse `std::sync::Mutex`. Never held across an `.await`. Every method is O(1).
//! - `cache_size` and `active_subscriptions` are not tracked here. The orchestrator fills
//!   them into the snapshot because it owns the cache and the subscription table. 🦆

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

use crate::clock::Clock;

/// 📏 How many fetch latencies we remember before the oldest one falls off the edge.
pub const DEFAULT_FETCH_TIME_SAMPLES: usize = 100;

/// 📸 A point-in-time copy of every counter the feed exposes to diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MetricsSnapshot {
    /// ⏱️ mean of the samples currently in the ring buffer, 0 when it is empty
    pub average_fetch_time_ms: f64,
    /// 🎯 hits / (hits + misses), 0 when nothing has been looked up yet
    pub cache_hit_rate: f64,
    pub sample_count: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    pub active_subscriptions: usize,
    pub uptime_ms: i64,
    /// 🧹 epoch millis of the last maintenance pass, if one has happened
    pub last_cleanup_ms: Option<i64>,
    /// 🧹 cache entry count observed by the last maintenance pass
    pub memory_usage: usize,
}

impl MetricsSnapshot {
    /// 🎨 Two columns, right-aligned numbers. Renders the same on every terminal we tried.
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["metric", "value"]);

        let last_cleanup = self
            .last_cleanup_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());

        let rows = [
            ("avg fetch time", format!("{:.2} ms", self.average_fetch_time_ms)),
            ("fetch samples", self.sample_count.to_string()),
            ("cache hit rate", format!("{:.1}%", self.cache_hit_rate * 100.0)),
            ("cache hits", self.cache_hits.to_string()),
            ("cache misses", self.cache_misses.to_string()),
            ("cache size", self.cache_size.to_string()),
            ("active subscriptions", self.active_subscriptions.to_string()),
            ("uptime", format!("{:.1} s", self.uptime_ms as f64 / 1000.0)),
            ("last cleanup", last_cleanup),
            ("entries at last cleanup", self.memory_usage.to_string()),
        ];
        for (name, value) in rows {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        }
        table.to_string()
    }
}

#[derive(Debug)]
struct MetricsState {
    fetch_times_ms: VecDeque<f64>,
    cache_hits: u64,
    cache_misses: u64,
    last_cleanup: Option<DateTime<Utc>>,
    memory_usage: usize,
}

/// 📊 The Metrics Recorder. Cheap to call from anywhere, safe to share across tasks.
#[derive(Debug)]
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
    max_samples: usize,
    started_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl MetricsRecorder {
    /// 🚀 `max_samples` of 0 is bumped to 1. A ring buffer with no slots is just a hole.
    pub fn new(max_samples: usize, clock: Arc<dyn Clock>) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            state: Mutex::new(MetricsState {
                fetch_times_ms: VecDeque::with_capacity(max_samples),
                cache_hits: 0,
                cache_misses: 0,
                last_cleanup: None,
                memory_usage: 0,
            }),
            max_samples,
            started_at: clock.now(),
            clock,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ⏱️ Push a latency sample. Past capacity, the oldest one is dropped first.
    pub fn record_fetch_time(&self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut state = self.state();
        if state.fetch_times_ms.len() == self.max_samples {
            state.fetch_times_ms.pop_front();
        }
        state.fetch_times_ms.push_back(ms);
    }

    pub fn record_cache_hit(&self) {
        self.state().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.state().cache_misses += 1;
    }

    /// 🧹 Remember when maintenance last ran and how big the cache was afterwards.
    pub fn record_cleanup(&self, cache_size: usize) {
        let now = self.clock.now();
        let mut state = self.state();
        state.last_cleanup = Some(now);
        state.memory_usage = cache_size;
    }

    /// 📸 Copy everything out under one lock acquisition.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let state = self.state();

        let sample_count = state.fetch_times_ms.len();
        let average_fetch_time_ms = if sample_count == 0 {
            0.0
        } else {
            state.fetch_times_ms.iter().sum::<f64>() / sample_count as f64
        };
        let lookups = state.cache_hits + state.cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            state.cache_hits as f64 / lookups as f64
        };

        MetricsSnapshot {
            average_fetch_time_ms,
            cache_hit_rate,
            sample_count,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            cache_size: 0,
            active_subscriptions: 0,
            uptime_ms: (now - self.started_at).num_milliseconds().max(0),
            last_cleanup_ms: state.last_cleanup.map(|at| at.timestamp_millis()),
            memory_usage: state.memory_usage,
        }
    }
}
