// ai
//! 📰 feedx: the ranking core of a campus social feed.
//!
//! 🎬 Posts come in live from a document store. They leave scored, ordered, and with their
//! authors attached, while a bounded cache keeps the store from being asked the same
//! question twice and a coalescer batches the analytics exhaust. 🦆
//!
//! Start at [`orchestrator::FeedOrchestrator`]; everything else is a part it's built from.

pub mod app_config;
pub mod backends;
pub mod cache;
pub mod clock;
pub mod coalescer;
pub mod common;
pub mod debounce;
pub mod metrics;
pub mod orchestrator;
pub mod report;
pub mod scoring;
pub mod subscriptions;
pub mod workers;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::common::OrderingMode;
use crate::orchestrator::{FeedOrchestrator, FeedUpdate};
use crate::report::FeedReport;

/// 🎛️ What a single `run` should do, as decided by the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: OrderingMode,
    /// Rank for this user, loaded from the profile collection. Overrides `[viewer]`.
    pub viewer_id: Option<String>,
    /// Wait for this many ordered updates before reporting. At least one.
    pub updates: usize,
    /// Give up waiting for the next update after this long.
    pub update_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: OrderingMode::Relevance,
            viewer_id: None,
            updates: 1,
            update_timeout: Duration::from_secs(30),
        }
    }
}

/// 🚀 Open a ranked feed, wait for `options.updates` orderings, report the last one, shut down.
pub async fn run(app_config: AppConfig, options: RunOptions) -> Result<FeedReport> {
    let orchestrator = FeedOrchestrator::from_config(&app_config)
        .await
        .context("💀 Could not assemble the feed orchestrator from the config.")?;
    orchestrator.spawn_maintenance();

    let result = rank_once(&orchestrator, &app_config, &options).await;
    // -- shut down either way, a half-open subscription is nobody's friend
    let shutdown = orchestrator.shutdown().await;
    let report = result?;
    shutdown.context("💀 The feed worked, but shutting down did not.")?;
    Ok(report)
}

async fn rank_once(
    orchestrator: &FeedOrchestrator,
    app_config: &AppConfig,
    options: &RunOptions,
) -> Result<FeedReport> {
    let viewer = match (&options.viewer_id, &app_config.viewer) {
        (Some(viewer_id), _) => Some(orchestrator.viewer_context(viewer_id).await?),
        (None, Some(configured)) => Some(configured.to_context()),
        (None, None) => None,
    };
    let viewer_id = viewer.as_ref().map(|viewer| viewer.viewer_id.clone());
    info!(
        "📺 opening a {} feed for {}",
        options.mode,
        viewer_id.as_deref().unwrap_or("an anonymous viewer")
    );

    let feed = orchestrator.get_ranked_feed(viewer, options.mode).await?;
    let wanted = options.updates.max(1);
    let mut latest = None;
    let mut updates_seen = 0;

    while updates_seen < wanted {
        let update = tokio::time::timeout(options.update_timeout, feed.updates.recv())
            .await
            .with_context(|| {
                format!(
                    "💀 No feed update within {:?}. The backing store is either asleep or empty-handed.",
                    options.update_timeout
                )
            })?
            .context("💀 The feed closed before delivering anything.")?;
        match update {
            FeedUpdate::Ordered(items) => {
                updates_seen += 1;
                info!("📰 update {updates_seen}/{wanted}: {} posts ordered", items.len());
                latest = Some(items);
            }
            FeedUpdate::Disconnected(message) if latest.is_none() => {
                bail!("💀 The live query failed before the first ordering: {message}");
            }
            FeedUpdate::Disconnected(message) => {
                warn!("⚠️ live query reported a failure, reporting what we have: {message}");
                break;
            }
        }
    }
    orchestrator.stop_feed(&feed).await;

    Ok(FeedReport {
        mode: options.mode,
        viewer_id,
        items: latest.unwrap_or_default(),
        metrics: orchestrator.get_metrics_snapshot().await,
        updates_seen,
        generated_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{FileSourceConfig, SourceConfig};
    use std::io::Write;

    #[tokio::test]
    async fn the_one_where_a_snapshot_file_becomes_a_ranked_report() -> Result<()> {
        let mut snapshot = tempfile::NamedTempFile::new()?;
        writeln!(
            snapshot,
            r#"{{"collection": "posts", "id": "p1", "userId": "fran", "likeCount": 3, "timestamp": "2026-03-01T11:00:00Z"}}"#
        )?;
        writeln!(
            snapshot,
            r#"{{"collection": "posts", "id": "p2", "userId": "sam", "likeCount": 9, "timestamp": "2026-03-01T10:00:00Z"}}"#
        )?;
        writeln!(
            snapshot,
            r#"{{"collection": "users", "id": "fran", "firstName": "Fran"}}"#
        )?;

        let app_config = AppConfig {
            source_config: SourceConfig::File(FileSourceConfig {
                file_name: snapshot.path().display().to_string(),
            }),
            ..AppConfig::default()
        };
        let options = RunOptions {
            mode: OrderingMode::MostLiked,
            ..RunOptions::default()
        };

        let report = run(app_config, options).await?;
        let ids: Vec<&str> = report.items.iter().map(|r| r.item.id.as_str()).collect();
        assert_eq!(ids, ["p2", "p1"]);
        assert_eq!(report.updates_seen, 1);
        assert_eq!(report.metrics.active_subscriptions, 0, "the feed is stopped before the report");
        assert!(report.render().contains("Fran"));
        Ok(())
    }
}
