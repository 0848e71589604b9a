// ai
//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The disk was quiet. Too quiet. Someone exported the posts collection to NDJSON for a
//! demo, forgot a closing brace on line 812, and went to lunch.
//!
//! This module does two jobs:
//! - [`load_snapshot`] reads a newline-delimited JSON file where every line is one document
//!   tagged with its collection (`{"collection": "posts", "id": "p1", ...}`) and loads the
//!   lot into an [`InMemoryStore`]. Blank lines are skipped. A broken line fails the load
//!   with its line number, because "invalid JSON" on its own helps nobody.
//! - [`FileMetricsSink`] appends one NDJSON line per flushed analytics group.
//!
//! 💀 Disk full → your problem now
//! 🦆 (mandatory, no notes)

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, trace};

use crate::backends::MetricsSink;
use crate::backends::in_mem::InMemoryStore;
use crate::common::Record;

// -- 📂 FileSourceConfig lives here, close to the loader that actually uses it.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSourceConfig {
    pub file_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileSinkConfig {
    pub file_name: String,
}

/// 📥 Load an NDJSON snapshot into a fresh [`InMemoryStore`].
pub async fn load_snapshot(config: &FileSourceConfig) -> Result<InMemoryStore> {
    let contents = tokio::fs::read_to_string(&config.file_name)
        .await
        .with_context(|| {
            format!(
                "💀 The snapshot file '{}' could not be read. We stared at the path. \
                 The path stared back. Check that it exists and that we may read it.",
                config.file_name
            )
        })?;

    let mut by_collection: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_number = index + 1;
        let mut record: Record = serde_json::from_str(line).with_context(|| {
            format!(
                "💀 Line {line_number} of '{}' is not a JSON object. Somebody forgot a brace.",
                config.file_name
            )
        })?;
        let collection = match record.remove("collection") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => bail!(
                "💀 Line {line_number} of '{}' has no \"collection\" field, so we don't know where it lives.",
                config.file_name
            ),
        };
        by_collection.entry(collection).or_default().push(record);
    }

    let store = InMemoryStore::new();
    for (collection, records) in by_collection {
        let count = records.len();
        store
            .upsert_many(&collection, records)
            .with_context(|| format!("💀 Loading collection '{collection}' from the snapshot failed."))?;
        debug!("📂 loaded {count} documents into '{collection}'");
    }
    Ok(store)
}

/// 🚰 FileMetricsSink: appends one line per flushed group to a file. I/O only.
///
/// Opened in append mode, so restarting the process never eats yesterday's analytics.
#[derive(Debug)]
pub struct FileMetricsSink {
    file_buf: io::BufWriter<File>,
    sink_config: FileSinkConfig,
}

impl FileMetricsSink {
    pub async fn new(sink_config: FileSinkConfig) -> Result<Self> {
        let file_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink_config.file_name)
            .await
            .with_context(|| {
                format!(
                    "💀 The metrics file '{}' could not be opened for appending. \
                     One of us was wrong about whether the parent directory existed. It was us.",
                    sink_config.file_name
                )
            })?;
        Ok(Self {
            file_buf: io::BufWriter::new(file_handle),
            sink_config,
        })
    }
}

#[async_trait]
impl MetricsSink for FileMetricsSink {
    async fn write_batch(&mut self, kind: &str, records: Vec<Value>) -> Result<()> {
        let line = json!({
            "kind": kind,
            "count": records.len(),
            "written_at": Utc::now().timestamp_millis(),
            "records": records,
        });
        let mut payload = serde_json::to_string(&line)?;
        payload.push('\n');
        trace!("📬 {} bytes of '{kind}' walked into the file sink", payload.len());

        self.file_buf.write_all(payload.as_bytes()).await?;
        // -- 🚽 flush per group: a crash should lose at most the group in flight
        self.file_buf.flush().await.with_context(|| {
            format!("💀 Error flushing metrics to '{}'.", self.sink_config.file_name)
        })?;
        Ok(())
    }
}
