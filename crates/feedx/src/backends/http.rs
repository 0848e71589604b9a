// ai
//! 📡 The HTTP backend: a backing store and a metrics sink on the far side of a socket.
//!
//! 🎬 *[a campus API gateway. 2:14 AM. someone deployed on a Friday.]*
//!
//! Routes, relative to the configured base `url`:
//! ```text
//!   GET  {url}/{collection}/{id}        one document, 404 = absent
//!   GET  {url}/{collection}?order_by=…  a JSON array of documents
//!   POST {url}/{kind}/_batch            NDJSON, one analytics record per line
//! ```
//!
//! Live queries are polled: every `poll_interval_ms` the query is re-run, and a snapshot is
//! pushed only when the result set changed. A failed poll pushes an error event and keeps
//! polling, so the subscriber decides whether the outage is fatal.
//!
//! 🔒 Auth: API key wins over basic auth. This is not a democracy. 🦆

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backends::{LiveSource, LiveStream, MetricsSink, PointReader, SourceEvent};
use crate::common::{CollectionQuery, Direction, Record, SubscriptionKey};

/// 🔒 Credentials shared by both HTTP configs. All optional.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HttpAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl HttpAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(api_key) = &self.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(username) = &self.username {
            request.basic_auth(username, self.password.as_ref())
        } else {
            request
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    #[serde(flatten)]
    pub auth: HttpAuth,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSinkConfig {
    pub url: String,
    #[serde(flatten)]
    pub auth: HttpAuth,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_timeout_secs() -> u64 {
    30
}

/// 🔧 10 seconds to connect, `timeout_secs` for the whole exchange. We will wait, but not forever.
fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL.")
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// 📄 Non-2xx becomes an error carrying the status and whatever the server had to say.
async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("💀 {what} answered {status}. The server's last words: {body}")
}

// ===== store =====

#[derive(Debug, Clone)]
struct HttpReader {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpReader {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let url = format!("{}/{collection}/{id}", base(&self.config.url));
        trace!("📡 GET {url}");
        let response = self
            .config
            .auth
            .apply(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("💀 Reached out to '{url}' and got ghosted."))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut record: Record = ensure_success(response, &url)
            .await?
            .json()
            .await
            .with_context(|| format!("💀 '{url}' returned something that is not a JSON object."))?;
        record
            .entry("id")
            .or_insert_with(|| Value::String(id.to_string()));
        Ok(Some(record))
    }

    async fn list(&self, collection: &str, query: &CollectionQuery) -> Result<Vec<Record>> {
        let url = format!("{}/{collection}", base(&self.config.url));
        let direction = match query.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        let mut params: Vec<(String, String)> = vec![
            ("order_by".to_string(), query.order_by_field.clone()),
            ("direction".to_string(), direction.to_string()),
            ("limit".to_string(), query.limit.to_string()),
            ("offset".to_string(), query.offset.to_string()),
        ];
        params.extend(
            query
                .filters
                .iter()
                .map(|(field, value)| (field.clone(), value.clone())),
        );

        trace!("📡 GET {url} {params:?}");
        let response = self
            .config
            .auth
            .apply(self.client.get(&url).query(&params))
            .send()
            .await
            .with_context(|| format!("💀 Reached out to '{url}' and got ghosted."))?;
        ensure_success(response, &url)
            .await?
            .json()
            .await
            .with_context(|| format!("💀 '{url}' did not return a JSON array of documents."))
    }
}

/// 📡 A backing store behind an HTTP API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpStore {
    reader: HttpReader,
    polls: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_stream_id: Arc<AtomicU64>,
}

impl HttpStore {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        Ok(Self {
            reader: HttpReader {
                client: build_client(config.timeout_secs)?,
                config,
            },
            polls: Arc::default(),
            next_stream_id: Arc::default(),
        })
    }
}

#[async_trait]
impl PointReader for HttpStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.reader.get(collection, id).await
    }

    async fn list(&self, collection: &str, query: &CollectionQuery) -> Result<Vec<Record>> {
        self.reader.list(collection, query).await
    }
}

#[async_trait]
impl LiveSource for HttpStore {
    async fn open(&self, key: &SubscriptionKey) -> Result<LiveStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = async_channel::unbounded();
        let reader = self.reader.clone();
        let collection = key.collection.clone();
        let query = CollectionQuery::from(key);
        let period = Duration::from_millis(reader.config.poll_interval_ms.max(1));

        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut last_seen: Option<Vec<Record>> = None;
            loop {
                ticker.tick().await;
                let event = match reader.list(&collection, &query).await {
                    Ok(records) if last_seen.as_ref() == Some(&records) => continue,
                    Ok(records) => {
                        last_seen = Some(records.clone());
                        SourceEvent::Batch(records)
                    }
                    Err(err) => {
                        warn!("📡 poll of '{collection}' failed: {err:#}");
                        SourceEvent::Error(format!("{err:#}"))
                    }
                };
                if tx.send(event).await.is_err() {
                    trace!("🔇 nobody is listening to stream {id} anymore");
                    return;
                }
            }
        });

        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, poll);
        debug!("🌊 polling {} as stream {id}", key.signature());
        Ok(LiveStream { id, events })
    }

    async fn close(&self, stream_id: u64) -> Result<()> {
        let poll = self
            .polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream_id);
        if let Some(poll) = poll {
            poll.abort();
            debug!("🔌 stopped polling stream {stream_id}");
        }
        Ok(())
    }
}

// ===== sink =====

/// 📡 POSTs each flushed analytics group as NDJSON to `{url}/{kind}/_batch`.
#[derive(Debug)]
pub struct HttpMetricsSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpMetricsSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            config,
        })
    }
}

#[async_trait]
impl MetricsSink for HttpMetricsSink {
    async fn write_batch(&mut self, kind: &str, records: Vec<Value>) -> Result<()> {
        let url = format!("{}/{kind}/_batch", base(&self.config.url));
        let mut payload = String::new();
        for record in &records {
            payload.push_str(&serde_json::to_string(record)?);
            payload.push('\n');
        }
        debug!("📡 sending {} '{kind}' records ({} bytes)", records.len(), payload.len());

        let response = self
            .config
            .auth
            .apply(self.client.post(&url))
            // ⚠️ NDJSON, not JSON. The x- prefix means "we made this up but we're committing to it."
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("💀 The metrics batch for '{kind}' never reached '{url}'."))?;
        ensure_success(response, &url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_config(server: &MockServer) -> HttpSourceConfig {
        HttpSourceConfig {
            url: format!("{}/", server.uri()),
            auth: HttpAuth {
                api_key: Some("sekret".to_string()),
                ..HttpAuth::default()
            },
            poll_interval_ms: 10,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn the_one_where_a_missing_document_is_just_none() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/ada"))
            .and(header("Authorization", "ApiKey sekret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"firstName": "Ada"})))
            .mount(&server)
            .await;

        let store = HttpStore::new(source_config(&server))?;
        assert_eq!(store.get("users", "ghost").await?, None);
        let ada = store.get("users", "ada").await?.expect("💀 ada should exist");
        assert_eq!(ada["id"], "ada", "the id is filled in from the path");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_500_is_an_error_not_a_shrug() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/ada"))
            .respond_with(ResponseTemplate::new(500).set_body_string("database on fire"))
            .mount(&server)
            .await;

        let store = HttpStore::new(source_config(&server))?;
        let err = store.get("users", "ada").await.expect_err("💀 500 must fail");
        assert!(format!("{err:#}").contains("database on fire"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_page_queries_become_query_params() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .and(query_param("order_by", "createdAt"))
            .and(query_param("direction", "desc"))
            .and(query_param("offset", "20"))
            .and(query_param("school", "North"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "p1"}])))
            .mount(&server)
            .await;

        let store = HttpStore::new(source_config(&server))?;
        let query = CollectionQuery {
            offset: 20,
            limit: 10,
            ..CollectionQuery::from(&SubscriptionKey::new("posts").filter("school", "North"))
        };
        let page = store.list("posts", &query).await?;
        assert_eq!(page.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_polling_delivers_the_first_snapshot() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "p1"}])))
            .mount(&server)
            .await;

        let store = HttpStore::new(source_config(&server))?;
        let stream = store.open(&SubscriptionKey::new("posts")).await?;
        match stream.events.recv().await? {
            SourceEvent::Batch(records) => assert_eq!(records.len(), 1),
            other => panic!("💀 expected a snapshot, got {other:?}"),
        }
        store.close(stream.id).await?;
        assert!(stream.events.recv().await.is_err(), "aborting the poll drops the sender");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_metrics_leave_as_ndjson() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fetch_time/_batch"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string("{\"ms\":3}\n{\"ms\":4}\n"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut sink = HttpMetricsSink::new(HttpSinkConfig {
            url: server.uri(),
            auth: HttpAuth::default(),
            timeout_secs: 5,
        })?;
        sink.write_batch("fetch_time", vec![json!({"ms": 3}), json!({"ms": 4})])
            .await?;
        Ok(())
    }
}
