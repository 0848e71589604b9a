//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 The backing store pours records in through live subscriptions and point reads.
//! The metrics sink slurps coalesced analytics out. The ranking core sits in between,
//! blissfully ignorant of whether any of it lives in RAM, on disk, or behind an HTTP API.
//!
//! 🎭 This module is the casting agency. Three roles, three traits:
//! - [`LiveSource`]: open a standing query, get a stream of full result snapshots.
//! - [`PointReader`]: fetch one record by id, or one page of a collection.
//! - [`MetricsSink`]: accept a batch of analytics records of one kind.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.
//!
//! # Knowledge Graph 🧠
//! - Pattern: trait → concrete impls (InMemoryStore, HttpStore, FileMetricsSink, ...) → enum dispatcher
//! - `SourceBackend` implements both store traits, `SinkBackend` implements the sink trait.
//! - Each backend's config lives next to the backend that uses it.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::common::{CollectionQuery, Record, SubscriptionKey};

pub mod file;
pub mod http;
pub mod in_mem;

pub use file::{FileSinkConfig, FileSourceConfig};
pub use http::{HttpSinkConfig, HttpSourceConfig};

// ===== Live subscriptions =====

/// 📬 One delivery from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The complete current result set for the subscription's query. Never a diff.
    Batch(Vec<Record>),
    /// The backing store could not serve the query. The stream may keep going afterwards.
    Error(String),
}

/// 🌊 An open live subscription: an id to close it with, and the events it produces.
///
/// The channel closes when the source closes the stream.
#[derive(Debug)]
pub struct LiveStream {
    pub id: u64,
    pub events: async_channel::Receiver<SourceEvent>,
}

/// 🚰 A backing store that can keep a query open and push every change.
///
/// # Contract
/// - `open` must emit the current result set as its first event, then one event per change.
/// - Events for one stream are delivered in the order the store produced them.
/// - After `close(id)` returns, no further events are sent for that stream.
#[async_trait]
pub trait LiveSource: Debug + Send + Sync {
    async fn open(&self, key: &SubscriptionKey) -> Result<LiveStream>;
    async fn close(&self, stream_id: u64) -> Result<()>;
}

/// 🔍 One-shot reads, used when the cache comes up empty.
#[async_trait]
pub trait PointReader: Debug + Send + Sync {
    /// `Ok(None)` is a normal "no such document", not an error.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>>;
    async fn list(&self, collection: &str, query: &CollectionQuery) -> Result<Vec<Record>>;
}

/// 🎭 Every backing store feedx can talk to.
///
/// A file snapshot is loaded into an [`in_mem::InMemoryStore`] at startup, so it has no
/// variant of its own.
#[derive(Debug, Clone)]
pub enum SourceBackend {
    InMemory(in_mem::InMemoryStore),
    Http(http::HttpStore),
}

impl SourceBackend {
    /// 🏗️ Build the store named by the config. File snapshots are read here, up front.
    pub async fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(match config {
            SourceConfig::InMemory => SourceBackend::InMemory(in_mem::InMemoryStore::new()),
            SourceConfig::File(file_config) => {
                SourceBackend::InMemory(file::load_snapshot(file_config).await?)
            }
            SourceConfig::Http(http_config) => {
                SourceBackend::Http(http::HttpStore::new(http_config.clone())?)
            }
        })
    }
}

#[async_trait]
impl LiveSource for SourceBackend {
    async fn open(&self, key: &SubscriptionKey) -> Result<LiveStream> {
        match self {
            SourceBackend::InMemory(store) => store.open(key).await,
            SourceBackend::Http(store) => store.open(key).await,
        }
    }

    async fn close(&self, stream_id: u64) -> Result<()> {
        match self {
            SourceBackend::InMemory(store) => store.close(stream_id).await,
            SourceBackend::Http(store) => store.close(stream_id).await,
        }
    }
}

#[async_trait]
impl PointReader for SourceBackend {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        match self {
            SourceBackend::InMemory(store) => store.get(collection, id).await,
            SourceBackend::Http(store) => store.get(collection, id).await,
        }
    }

    async fn list(&self, collection: &str, query: &CollectionQuery) -> Result<Vec<Record>> {
        match self {
            SourceBackend::InMemory(store) => store.list(collection, query).await,
            SourceBackend::Http(store) => store.list(collection, query).await,
        }
    }
}

// ===== Metrics sink =====

/// 🕳️ Where coalesced analytics go to live out their days.
///
/// # Contract 📜
/// - `write_batch` gets every pending record of one kind, oldest first.
/// - Failures are returned, never retried here. The caller logs and moves on.
#[async_trait]
pub trait MetricsSink: Debug + Send {
    async fn write_batch(&mut self, kind: &str, records: Vec<Value>) -> Result<()>;
}

/// 🎭 The many faces of a metrics sink. Dispatches to the inner concrete type.
#[derive(Debug)]
pub enum SinkBackend {
    InMemory(in_mem::InMemoryMetricsSink),
    File(file::FileMetricsSink),
    Http(http::HttpMetricsSink),
}

impl SinkBackend {
    pub async fn from_config(config: &SinkConfig) -> Result<Self> {
        Ok(match config {
            SinkConfig::InMemory => SinkBackend::InMemory(in_mem::InMemoryMetricsSink::new()),
            SinkConfig::File(file_config) => {
                SinkBackend::File(file::FileMetricsSink::new(file_config.clone()).await?)
            }
            SinkConfig::Http(http_config) => {
                SinkBackend::Http(http::HttpMetricsSink::new(http_config.clone())?)
            }
        })
    }
}

#[async_trait]
impl MetricsSink for SinkBackend {
    async fn write_batch(&mut self, kind: &str, records: Vec<Value>) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.write_batch(kind, records).await,
            SinkBackend::File(sink) => sink.write_batch(kind, records).await,
            SinkBackend::Http(sink) => sink.write_batch(kind, records).await,
        }
    }
}

// ===== Configs =====

/// 📡 Which backing store to read from. Externally tagged: `[source_config.Http]` and friends.
#[derive(Debug, Deserialize, Clone, Default)]
pub enum SourceConfig {
    #[default]
    InMemory,
    File(FileSourceConfig),
    Http(HttpSourceConfig),
}

/// 🕳️ Which metrics sink to write analytics into.
#[derive(Debug, Deserialize, Clone, Default)]
pub enum SinkConfig {
    #[default]
    InMemory,
    File(FileSinkConfig),
    Http(HttpSinkConfig),
}
