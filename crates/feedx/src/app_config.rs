//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Every section has defaults, so an empty file (or no file at all) gives you an in-memory
//! store, an in-memory metrics sink, and the stock scoring weights.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{SinkConfig, SourceConfig};
use crate::coalescer::BatchConfig;
use crate::common::ViewerContext;
use crate::orchestrator::{CacheConfig, FeedConfig};
use crate::scoring::ScoringConfig;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default, alias = "runtime")]
    pub batching: BatchConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    /// 📡 Where posts and profiles come from.
    #[serde(default)]
    pub source_config: SourceConfig,
    /// 🕳️ Where coalesced analytics go.
    #[serde(default)]
    pub sink_config: SinkConfig,
    /// 👀 A viewer to rank for when nobody names one on the command line.
    #[serde(default)]
    pub viewer: Option<ViewerConfig>,
}

/// 👀 A viewer spelled out in config instead of loaded from the `users` collection.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    pub id: String,
    pub following: Vec<String>,
    pub interactions: HashMap<String, u32>,
    pub interests: Vec<String>,
    #[serde(alias = "university", alias = "school")]
    pub affiliation: Option<String>,
}

impl ViewerConfig {
    pub fn to_context(&self) -> ViewerContext {
        let mut viewer = ViewerContext::new(self.id.clone())
            .following(self.following.iter().cloned())
            .interests(&self.interests);
        for (author, count) in &self.interactions {
            viewer = viewer.interaction(author.clone(), *count);
        }
        match &self.affiliation {
            Some(affiliation) => viewer.affiliation(affiliation.clone()),
            None => viewer,
        }
    }
}

/// 🚀 Load the config from env vars (`FEEDX_*`) and an optional TOML file. TOML wins.
///
/// Nested keys use a double underscore: `FEEDX_CACHE__CAPACITY=1000`.
/// No file → env vars only. The scoring weights are validated before this returns,
/// so a config that would rank links above images never makes it out of here.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("FEEDX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (FEEDX_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (FEEDX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .scoring
        .validate()
        .context("💀 The [scoring] section parsed, but it breaks the ranking rules.")?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Direction;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp config. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config.");
        file
    }

    #[test]
    fn the_one_where_every_section_moves_into_its_own_apartment() {
        let config_file = write_test_config(
            r#"
            [scoring]
            comment_weight = 7.5

            [cache]
            max_size = 64
            page_ttl_secs = 30

            [batching]
            batch_size = 25

            [feed]
            collection = "campus_posts"
            direction = "asc"
            analytics_sample_rate = 0.5

            [source_config.File]
            file_name = "snapshot.ndjson"

            [sink_config.Http]
            url = "http://localhost:9200"
            api_key = "abc"

            [viewer]
            id = "ada"
            following = ["bob"]
            university = "North"
            "#,
        );

        let app_config = load_config(Some(config_file.path()))
            .expect("💀 Full config should parse. The schema drift goblin does not get this win.");

        assert_eq!(app_config.scoring.comment_weight, 7.5);
        assert_eq!(app_config.scoring.like_weight, 1.0, "untouched weights keep defaults");
        assert_eq!(app_config.cache.capacity, 64, "max_size is the old name for capacity");
        assert_eq!(app_config.cache.page_ttl_secs, 30);
        assert_eq!(app_config.cache.profile_ttl_secs, 1800);
        assert_eq!(app_config.batching.batch_size, 25);
        assert_eq!(app_config.batching.batch_timeout_ms, 100);
        assert_eq!(app_config.feed.collection, "campus_posts");
        assert_eq!(app_config.feed.direction, Direction::Asc);
        assert!(matches!(app_config.source_config, SourceConfig::File(ref f) if f.file_name == "snapshot.ndjson"));
        match app_config.sink_config {
            SinkConfig::Http(http) => assert_eq!(http.auth.api_key.as_deref(), Some("abc")),
            honestly_who_knows => panic!(
                "💀 Expected an Http sink config, but serde took us to {honestly_who_knows:?}. Plot twist energy."
            ),
        }
        let viewer = app_config.viewer.expect("💀 viewer section should parse").to_context();
        assert!(viewer.following.contains("bob"));
        assert_eq!(viewer.affiliation.as_deref(), Some("North"));
    }

    #[test]
    fn the_one_where_an_empty_file_is_a_perfectly_good_config() {
        let config_file = write_test_config("");
        let app_config = load_config(Some(config_file.path()))
            .expect("💀 Defaults should carry an empty file.");

        assert!(matches!(app_config.source_config, SourceConfig::InMemory));
        assert!(matches!(app_config.sink_config, SinkConfig::InMemory));
        assert_eq!(app_config.cache.capacity, 500);
        assert_eq!(app_config.feed.limit, 50);
        assert!(app_config.viewer.is_none());
    }

    #[test]
    fn the_one_where_bad_weights_never_leave_the_loader() {
        let config_file = write_test_config(
            r#"
            [scoring]
            image_modifier = 0.5
            "#,
        );
        let err = load_config(Some(config_file.path()))
            .expect_err("💀 image below video must be rejected");
        assert!(format!("{err:#}").contains("image_modifier"));
    }
}
