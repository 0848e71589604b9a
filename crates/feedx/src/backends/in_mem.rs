//! # Previously, on feedx...
//!
//! 🎬 The backing store was remote. Slow. Billed per read. Someone had to stand in for it
//! during tests, local development and file-snapshot demos. Someone had to be brave.
//! Someone had to write a document store so simple it lives entirely in RAM, gone the
//! moment you blink.
//!
//! That someone was this module.
//!
//! [`InMemoryStore`] holds collections of records, answers point reads and paged queries,
//! and keeps live queries open: every write re-runs each matching query and pushes the
//! complete new result set down that stream. No partial patching.
//! [`InMemoryMetricsSink`] hoards every batch it is handed behind an `Arc<Mutex<...>>`
//! so tests can inspect what arrived, and can be told to fail on purpose.
//!
//! 🦆
//!
//! ✅ No network calls. No disk I/O. Just vibes and heap memory.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_channel::Sender;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backends::{LiveSource, LiveStream, MetricsSink, PointReader, SourceEvent};
use crate::common::{CollectionQuery, Direction, Record, SubscriptionKey, parse_timestamp, string_field};

#[derive(Debug)]
struct OpenStream {
    key: SubscriptionKey,
    tx: Sender<SourceEvent>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// collection name → (document id → record). Records always carry their `"id"`.
    collections: HashMap<String, BTreeMap<String, Record>>,
    streams: HashMap<u64, OpenStream>,
    next_stream_id: u64,
    /// ⏳ how long each point read takes, for exercising slow stores
    read_delay: Option<Duration>,
}

impl StoreState {
    fn snapshot_for(&self, key: &SubscriptionKey) -> Vec<Record> {
        let query = CollectionQuery::from(key);
        run_query(self.collections.get(&key.collection), &query)
    }

    /// 📣 Push a fresh snapshot to every open stream on `collection`. Streams whose
    /// receiver is gone get forgotten.
    fn broadcast(&mut self, collection: &str) {
        let mut hung_up = Vec::new();
        for (id, stream) in &self.streams {
            if stream.key.collection != collection {
                continue;
            }
            let snapshot = self.snapshot_for(&stream.key);
            if stream.tx.try_send(SourceEvent::Batch(snapshot)).is_err() {
                hung_up.push(*id);
            }
        }
        for id in hung_up {
            trace!("🔇 stream {id} has no listener anymore, dropping it");
            self.streams.remove(&id);
        }
    }
}

/// 🧠 A document store in a `Mutex`. Clone it freely: every clone is the same store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 📥 Insert or replace one document, then notify live queries on that collection.
    pub fn upsert(&self, collection: &str, record: Record) -> Result<()> {
        self.upsert_many(collection, [record])
    }

    /// 📥 Insert or replace many documents with a single notification at the end.
    pub fn upsert_many<I>(&self, collection: &str, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut state = self.state();
        let documents = state.collections.entry(collection.to_string()).or_default();
        for record in records {
            let Some(id) = string_field(&record, &["id"]) else {
                bail!("💀 Every document in '{collection}' needs an \"id\". This one had none: {record:?}");
            };
            documents.insert(id, record);
        }
        state.broadcast(collection);
        Ok(())
    }

    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut state = self.state();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.remove(id))
            .is_some();
        if removed {
            state.broadcast(collection);
        }
        removed
    }

    /// 💥 Simulate the backing store falling over for every live query on `collection`.
    pub fn fail_streams(&self, collection: &str, message: &str) {
        let state = self.state();
        for stream in state.streams.values().filter(|s| s.key.collection == collection) {
            let _ = stream.tx.try_send(SourceEvent::Error(message.to_string()));
        }
    }

    /// 🐌 Make every point read sleep this long first. `None` puts reads back to instant.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state().read_delay = delay;
    }

    pub fn open_stream_count(&self) -> usize {
        self.state().streams.len()
    }
}

#[async_trait]
impl LiveSource for InMemoryStore {
    async fn open(&self, key: &SubscriptionKey) -> Result<LiveStream> {
        let (tx, events) = async_channel::unbounded();
        let mut state = self.state();
        let id = state.next_stream_id;
        state.next_stream_id += 1;

        // -- 📸 the first event is always the current result set
        tx.try_send(SourceEvent::Batch(state.snapshot_for(key)))
            .context("💀 A brand new stream refused its very first snapshot.")?;
        state.streams.insert(
            id,
            OpenStream {
                key: key.clone(),
                tx,
            },
        );
        debug!("🌊 opened in-memory stream {id} for {}", key.signature());
        Ok(LiveStream { id, events })
    }

    async fn close(&self, stream_id: u64) -> Result<()> {
        // -- dropping the sender closes the receiver's channel
        if self.state().streams.remove(&stream_id).is_some() {
            debug!("🔌 closed in-memory stream {stream_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl PointReader for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let delay = self.state().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state()
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn list(&self, collection: &str, query: &CollectionQuery) -> Result<Vec<Record>> {
        Ok(run_query(self.state().collections.get(collection), query))
    }
}

// ===== query evaluation =====

/// 🔎 filter → order → offset → limit. Ties keep document-id order.
fn run_query(documents: Option<&BTreeMap<String, Record>>, query: &CollectionQuery) -> Vec<Record> {
    let Some(documents) = documents else {
        return Vec::new();
    };
    let mut matches: Vec<&Record> = documents
        .values()
        .filter(|record| {
            query
                .filters
                .iter()
                .all(|(field, expected)| field_matches(record.get(field), expected))
        })
        .collect();

    matches.sort_by(|a, b| {
        let ordering = compare_fields(a.get(&query.order_by_field), b.get(&query.order_by_field));
        match query.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    });

    matches
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .cloned()
        .collect()
}

/// Equality filters compare as text, so `"42"` matches both `42` and `"42"`.
fn field_matches(actual: Option<&Value>, expected: &str) -> bool {
    match actual {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == expected,
    }
}

#[derive(Debug, PartialEq, PartialOrd)]
enum SortKey {
    Missing,
    Number(f64),
    Text(String),
}

fn sort_key(value: Option<&Value>) -> SortKey {
    match value {
        Some(Value::Number(n)) => n.as_f64().map_or(SortKey::Missing, SortKey::Number),
        Some(Value::Bool(b)) => SortKey::Number(f64::from(u8::from(*b))),
        Some(v @ Value::String(s)) => match parse_timestamp(v) {
            Some(at) => SortKey::Number(at.timestamp_millis() as f64),
            None => SortKey::Text(s.clone()),
        },
        Some(v @ Value::Object(_)) => parse_timestamp(v)
            .map_or(SortKey::Missing, |at| SortKey::Number(at.timestamp_millis() as f64)),
        // -- 📏 arrays sort by length, so `likes: [...]` orders like a like count
        Some(Value::Array(entries)) => SortKey::Number(entries.len() as f64),
        Some(Value::Null) | None => SortKey::Missing,
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    sort_key(a)
        .partial_cmp(&sort_key(b))
        .unwrap_or(Ordering::Equal)
}

// ===== metrics sink =====

/// 📦 A sink that never forgets. Clone-able so tests can peek after handing it off.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetricsSink {
    pub received: Arc<tokio::sync::Mutex<Vec<(String, Vec<Value>)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💥 While set, every write fails (and nothing is recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    pub async fn batches(&self) -> Vec<(String, Vec<Value>)> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn write_batch(&mut self, kind: &str, records: Vec<Value>) -> Result<()> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            bail!("💀 in-memory metrics sink was told to fail, and it is nothing if not obedient");
        }
        self.received.lock().await.push((kind.to_string(), records));
        Ok(())
    }
}
