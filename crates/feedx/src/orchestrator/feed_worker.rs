// ai
//! 🎬 *[a snapshot of 50 posts lands in a channel. somewhere, a student is scrolling.]*
//!
//! 🧵 The FeedWorker turns raw subscription batches into ordered feeds, one batch at a time,
//! in arrival order. For every batch it parses the records, resolves author profiles
//! (cache first, backing store second), applies the same-affiliation filter when asked,
//! scores when the mode needs scores, orders, and emits. Now and then it also drops an
//! algorithm-performance summary and a few per-post breakdowns into the coalescer.
//!
//! A stopped feed is checked twice per batch: before the work starts, and again after the
//! profile lookups come back. Lookups that finish late still warm the cache, but nothing
//! is emitted or sampled for a feed that is gone.
//!
//! Cache cleanup is NOT done here. That's the maintenance tick's job; the hot path stays hot. 🦆

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use anyhow::Result;
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::FeedCore;
use crate::coalescer::PendingOperation;
use crate::common::{AuthorProfile, ContentItem, OrderingMode, Record, ViewerContext};
use crate::metrics::MetricsSnapshot;
use crate::scoring::{ScoreBreakdown, ScoreCalculator};
use crate::workers::Worker;

/// 🏅 One post in an ordered feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedItem {
    pub item: ContentItem,
    /// The author's profile, if the author exists and could be resolved.
    pub author: Option<AuthorProfile>,
    /// `None` for raw-field orderings, which skip the scorer.
    pub score: Option<ScoreBreakdown>,
}

/// 📬 What the caller receives on a ranked feed's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    /// The complete, ordered feed as of the latest batch.
    Ordered(Vec<RankedItem>),
    /// The backing store reported a failure on the live query. Later batches may still come.
    Disconnected(String),
}

/// Raw events forwarded from the subscription callbacks.
#[derive(Debug)]
pub(crate) enum RawEvent {
    Batch(Vec<Record>),
    Error(String),
}

#[derive(Debug)]
pub(crate) struct FeedWorker {
    core: Arc<FeedCore>,
    raw: Receiver<RawEvent>,
    updates: Sender<FeedUpdate>,
    viewer: Option<ViewerContext>,
    mode: OrderingMode,
    cancelled: Arc<AtomicBool>,
}

impl FeedWorker {
    pub(crate) fn new(
        core: Arc<FeedCore>,
        raw: Receiver<RawEvent>,
        updates: Sender<FeedUpdate>,
        viewer: Option<ViewerContext>,
        mode: OrderingMode,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            core,
            raw,
            updates,
            viewer,
            mode,
            cancelled,
        }
    }

    async fn process(&self, records: Vec<Record>) -> Vec<RankedItem> {
        let items: Vec<ContentItem> = records
            .iter()
            .filter_map(|record| {
                let item = ContentItem::from_record(record);
                if item.is_none() {
                    trace!("🗑️ skipping a record without an id");
                }
                item
            })
            .collect();

        let profiles = self.resolve_profiles(&items).await;
        rank(
            items,
            &profiles,
            self.viewer.as_ref(),
            self.mode,
            &self.core.scorer,
            self.core.clock.now(),
        )
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// 👤 Cache-or-fetch every distinct author, concurrently. A failed lookup is a missing profile.
    async fn resolve_profiles(&self, items: &[ContentItem]) -> HashMap<String, Option<AuthorProfile>> {
        let authors: BTreeSet<&str> = items
            .iter()
            .filter_map(|item| item.author_id.as_deref())
            .collect();
        let lookups = authors.into_iter().map(|author| async move {
            let profile = match self.core.fetch_author_profile(author, false).await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!("👤 could not resolve author '{author}': {err:#}");
                    None
                }
            };
            (author.to_string(), profile)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// 🎲 Sampled analytics for one ordered batch: maybe a performance summary, and a
    /// per-post breakdown for each scored post that wins its own roll.
    fn report_analytics(&self, ranked: &[RankedItem]) {
        let config = &self.core.feed_config;
        let viewer_id = self.viewer.as_ref().map(|viewer| viewer.viewer_id.as_str());
        let now = self.core.clock.now();

        if sampled(config.analytics_sample_rate) {
            let metrics = self.core.metrics_snapshot();
            if let Some(summary) = performance_summary(ranked, viewer_id, &metrics, now) {
                self.core
                    .coalescer
                    .add(PendingOperation::new("algorithm_performance", summary));
            }
        }

        for entry in ranked {
            if !sampled(config.post_metrics_sample_rate) {
                continue;
            }
            if let Some(record) = post_metrics(entry, viewer_id, now) {
                self.core.coalescer.add(PendingOperation::new("post_metrics", record));
            }
        }
    }
}

fn sampled(rate: f64) -> bool {
    rate > 0.0 && rand::random::<f64>() < rate
}

impl Worker for FeedWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🧵 feed worker started ({} ordering)", self.mode);
            while let Ok(event) = self.raw.recv().await {
                if self.is_cancelled() {
                    break;
                }
                let update = match event {
                    RawEvent::Batch(records) => {
                        let ranked = self.process(records).await;
                        if self.is_cancelled() {
                            debug!("🔕 feed worker: stopped while ranking, dropping the batch");
                            break;
                        }
                        self.report_analytics(&ranked);
                        FeedUpdate::Ordered(ranked)
                    }
                    RawEvent::Error(message) => FeedUpdate::Disconnected(message),
                };
                // -- unbounded, so this only fails once the feed is closed
                if self.updates.try_send(update).is_err() {
                    debug!("🔇 feed worker: nobody is reading updates anymore");
                    break;
                }
            }
            debug!("🏁 feed worker: subscription gone, shutting down");
            Ok(())
        })
    }
}

// ===== ordering =====

/// 🏅 Filter (same-affiliation only), score (when needed), and order one batch.
///
/// Sorts are stable, so ties keep the order the backing store delivered.
pub(crate) fn rank(
    items: Vec<ContentItem>,
    profiles: &HashMap<String, Option<AuthorProfile>>,
    viewer: Option<&ViewerContext>,
    mode: OrderingMode,
    scorer: &ScoreCalculator,
    now: DateTime<Utc>,
) -> Vec<RankedItem> {
    let author_of = |item: &ContentItem| {
        item.author_id
            .as_ref()
            .and_then(|id| profiles.get(id))
            .cloned()
            .flatten()
    };

    let viewer_affiliation = viewer.and_then(|viewer| viewer.affiliation.as_deref());
    let mut ranked: Vec<RankedItem> = items
        .into_iter()
        .map(|item| {
            let author = author_of(&item);
            RankedItem {
                item,
                author,
                score: None,
            }
        })
        .filter(|ranked| match (mode, viewer_affiliation) {
            (OrderingMode::SameAffiliation, Some(affiliation)) => {
                ranked.item.affiliation.as_deref() == Some(affiliation)
                    || ranked
                        .author
                        .as_ref()
                        .and_then(|author| author.affiliation.as_deref())
                        == Some(affiliation)
            }
            _ => true,
        })
        .collect();

    if mode.needs_scoring() {
        for entry in &mut ranked {
            entry.score = Some(scorer.score_at(&entry.item, viewer, now));
        }
    }

    let final_score = |entry: &RankedItem| entry.score.map_or(0.0, |score| score.final_score);
    ranked.sort_by(|a, b| match mode {
        OrderingMode::Relevance | OrderingMode::SameAffiliation => {
            final_score(b).total_cmp(&final_score(a))
        }
        OrderingMode::Recency => b.item.timestamp_millis().cmp(&a.item.timestamp_millis()),
        OrderingMode::OldestFirst => a.item.timestamp_millis().cmp(&b.item.timestamp_millis()),
        OrderingMode::MostLiked => b.item.like_count.cmp(&a.item.like_count),
        OrderingMode::MostCommented => b.item.comment_count.cmp(&a.item.comment_count),
    });
    ranked
}

/// 📊 Average / max / min score and a high / medium / low split, plus the metrics snapshot.
///
/// `None` when nothing in the feed was scored.
pub(crate) fn performance_summary(
    ranked: &[RankedItem],
    viewer_id: Option<&str>,
    metrics: &MetricsSnapshot,
    now: DateTime<Utc>,
) -> Option<Value> {
    let scores: Vec<f64> = ranked
        .iter()
        .filter_map(|entry| entry.score.map(|score| score.final_score))
        .collect();
    if scores.is_empty() {
        return None;
    }

    let average = scores.iter().sum::<f64>() / scores.len() as f64;
    let max = scores.iter().copied().fold(f64::MIN, f64::max);
    let min = scores.iter().copied().fold(f64::MAX, f64::min);
    let high = scores.iter().filter(|s| **s > 100.0).count();
    let medium = scores.iter().filter(|s| (50.0..=100.0).contains(*s)).count();
    let low = scores.len() - high - medium;

    Some(json!({
        "viewer_id": viewer_id,
        "total_items": ranked.len(),
        "average_score": round2(average),
        "max_score": round2(max),
        "min_score": round2(min),
        "score_distribution": { "high": high, "medium": medium, "low": low },
        "metrics": metrics,
        "calculated_at": now.timestamp_millis(),
    }))
}

/// 🧾 One scored post, its sub-scores and its counters, ready for the metrics sink.
///
/// `None` for posts the mode did not score.
pub(crate) fn post_metrics(
    entry: &RankedItem,
    viewer_id: Option<&str>,
    now: DateTime<Utc>,
) -> Option<Value> {
    let score = entry.score?;
    let item = &entry.item;
    let author_name = entry
        .author
        .as_ref()
        .map_or("Anonymous", |author| author.display_name.as_str());

    Some(json!({
        "post_id": item.id,
        "viewer_id": viewer_id,
        "author_id": item.author_id,
        "author_name": author_name,
        "content_preview": item.text.chars().take(100).collect::<String>(),
        "scores": {
            "engagement": round2(score.engagement),
            "quality": round2(score.quality),
            "personalization": round2(score.personalization),
            "recency": round2(score.recency),
            "viral": round2(score.viral),
            "penalties": round2(score.penalties),
        },
        "final_score": round2(score.final_score),
        "post_metrics": {
            "age_hours": item.age_hours(now).map(|hours| (hours * 10.0).round() / 10.0),
            "total_engagement": item.total_engagement(),
            "likes": item.like_count,
            "comments": item.comment_count,
            "shares": item.share_count,
            "views": item.views.unwrap_or(0),
        },
        "calculated_at": now.timestamp_millis(),
    }))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scoring::ScoringConfig;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("💀 fixture timestamp must parse")
            .with_timezone(&Utc)
    }

    fn scorer() -> ScoreCalculator {
        ScoreCalculator::new(ScoringConfig::default(), Arc::new(ManualClock::new(now())))
    }

    fn post(id: &str, author: &str, hours_old: i64, likes: u64) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            author_id: Some(author.to_string()),
            created_at: Some(now() - TimeDelta::hours(hours_old)),
            like_count: likes,
            ..ContentItem::default()
        }
    }

    fn ids(ranked: &[RankedItem]) -> Vec<&str> {
        ranked.iter().map(|entry| entry.item.id.as_str()).collect()
    }

    #[test]
    fn the_one_where_raw_sorts_never_call_the_scorer() {
        let items = vec![post("a", "u", 5, 3), post("b", "u", 1, 9), post("c", "u", 9, 1)];
        let scorer = scorer();
        let profiles = HashMap::new();

        let liked = rank(items.clone(), &profiles, None, OrderingMode::MostLiked, &scorer, now());
        assert_eq!(ids(&liked), ["b", "a", "c"]);
        assert!(liked.iter().all(|entry| entry.score.is_none()));

        let recent = rank(items.clone(), &profiles, None, OrderingMode::Recency, &scorer, now());
        assert_eq!(ids(&recent), ["b", "a", "c"]);
        let oldest = rank(items, &profiles, None, OrderingMode::OldestFirst, &scorer, now());
        assert_eq!(ids(&oldest), ["c", "a", "b"]);
    }

    #[test]
    fn the_one_where_missing_timestamps_sort_as_the_dawn_of_time() {
        let mut timeless = post("t", "u", 0, 0);
        timeless.created_at = None;
        let items = vec![timeless, post("x", "u", 3, 0)];

        let oldest = rank(items, &HashMap::new(), None, OrderingMode::OldestFirst, &scorer(), now());
        assert_eq!(ids(&oldest), ["t", "x"]);
    }

    #[test]
    fn the_one_where_relevance_puts_the_friend_first() {
        let items = vec![post("stranger", "s", 1, 20), post("friend", "f", 1, 20)];
        let viewer = ViewerContext::new("me").following(["f"]);

        let ranked = rank(items, &HashMap::new(), Some(&viewer), OrderingMode::Relevance, &scorer(), now());
        assert_eq!(ids(&ranked), ["friend", "stranger"]);
        assert!(ranked[0].score.is_some_and(|s| s.personalization > 0.0));
    }

    #[test]
    fn the_one_where_same_affiliation_checks_the_post_and_the_author() {
        let mut tagged = post("tagged", "x", 1, 0);
        tagged.affiliation = Some("North".to_string());
        let via_profile = post("via-profile", "north-author", 2, 0);
        let outsider = post("outsider", "south-author", 1, 50);

        let profiles = HashMap::from([
            (
                "north-author".to_string(),
                Some(AuthorProfile {
                    id: "north-author".to_string(),
                    affiliation: Some("North".to_string()),
                    ..AuthorProfile::default()
                }),
            ),
            ("south-author".to_string(), None),
        ]);
        let viewer = ViewerContext::new("me").affiliation("North");
        let items = vec![tagged, via_profile, outsider];

        let ranked = rank(items.clone(), &profiles, Some(&viewer), OrderingMode::SameAffiliation, &scorer(), now());
        assert_eq!(ids(&ranked), ["tagged", "via-profile"]);
        assert!(ranked.iter().all(|entry| entry.score.is_some()));

        let no_school = ViewerContext::new("me");
        let unfiltered = rank(items, &profiles, Some(&no_school), OrderingMode::SameAffiliation, &scorer(), now());
        assert_eq!(unfiltered.len(), 3, "a viewer without an affiliation gets everything");
    }

    #[test]
    fn the_one_where_the_summary_buckets_scores() {
        let entry = |score: f64| RankedItem {
            item: ContentItem::default(),
            author: None,
            score: Some(ScoreBreakdown {
                final_score: score,
                ..ScoreBreakdown::default()
            }),
        };
        let ranked = vec![entry(150.0), entry(75.0), entry(50.0), entry(10.0)];

        let summary = performance_summary(&ranked, Some("me"), &MetricsSnapshot::default(), now())
            .expect("💀 scored feeds always summarize");
        assert_eq!(summary["score_distribution"]["high"], 1);
        assert_eq!(summary["score_distribution"]["medium"], 2);
        assert_eq!(summary["score_distribution"]["low"], 1);
        assert_eq!(summary["max_score"], 150.0);
        assert_eq!(summary["min_score"], 10.0);
        assert_eq!(summary["average_score"], 71.25);
        assert_eq!(summary["viewer_id"], "me");

        let unscored = vec![RankedItem {
            item: ContentItem::default(),
            author: None,
            score: None,
        }];
        assert!(performance_summary(&unscored, None, &MetricsSnapshot::default(), now()).is_none());
    }

    #[test]
    fn the_one_where_a_post_breakdown_carries_scores_and_counters() {
        let mut item = post("p1", "fran", 3, 4);
        item.comment_count = 2;
        item.text = "x".repeat(140);
        let scored = RankedItem {
            author: Some(AuthorProfile {
                id: "fran".to_string(),
                display_name: "Fran".to_string(),
                ..AuthorProfile::default()
            }),
            score: Some(scorer().score_at(&item, None, now())),
            item,
        };

        let record = post_metrics(&scored, Some("me"), now()).expect("💀 scored posts have a breakdown");
        assert_eq!(record["post_id"], "p1");
        assert_eq!(record["author_name"], "Fran");
        assert_eq!(record["content_preview"].as_str().map(str::len), Some(100));
        assert_eq!(record["post_metrics"]["age_hours"], 3.0);
        assert_eq!(record["post_metrics"]["total_engagement"], 6);
        assert_eq!(record["post_metrics"]["views"], 0);
        assert!(record["scores"]["recency"].as_f64().is_some_and(|r| r > 0.0));

        let unscored = RankedItem {
            score: None,
            ..scored
        };
        assert!(post_metrics(&unscored, None, now()).is_none());
    }
}
