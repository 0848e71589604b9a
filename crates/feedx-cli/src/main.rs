//! 🚀 feedx-cli: the front door, the bouncer, the maitre d' of feedx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config, sets up logging,
//! opens one ranked feed, prints it, and leaves. Like a guest who actually RSVP'd. 🦆

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use feedx::common::OrderingMode;
use feedx::RunOptions;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📰 Rank a campus feed once and print it.
#[derive(Debug, Parser)]
#[command(name = "feedx", version, about)]
struct Cli {
    /// Config file. Missing is fine: env vars (FEEDX_*) and defaults take over.
    #[arg(short, long, default_value = "feedx.toml")]
    config: PathBuf,

    /// relevance, recency, most-liked, most-commented, oldest-first, same-affiliation
    #[arg(short, long, default_value_t = OrderingMode::Relevance)]
    mode: OrderingMode,

    /// Rank for this user id instead of the configured [viewer].
    #[arg(short, long)]
    viewer: Option<String>,

    /// Wait for this many live updates before printing the last one.
    #[arg(short, long, default_value_t = 1)]
    updates: usize,

    /// Seconds to wait for each update before giving up.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Print the report as JSON instead of tables.
    #[arg(long)]
    json: bool,
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Rank the thing, print the thing
/// 5. Handle errors (cry)
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 🔒 A missing file is not an error here. A file we can't even stat is.
    let config_file = cli.config.as_path();
    let config_file_that_exists = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Couldn't check whether the configuration file exists. Maybe a permissions or \
             pwd/cwd thing; an absolute path removes all doubt. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => None,
    };

    let app_config = feedx::app_config::load_config(config_file_that_exists)
        .context("💀 In feedx-cli, main, we couldn't load the config. Take a look at the file and the FEEDX_* env vars.")?;

    let options = RunOptions {
        mode: cli.mode,
        viewer_id: cli.viewer,
        updates: cli.updates,
        update_timeout: Duration::from_secs(cli.timeout_secs),
    };

    match feedx::run(app_config, options).await {
        Ok(report) if cli.json => {
            let rendered = serde_json::to_string_pretty(&report)
                .context("💀 The report refused to become JSON.")?;
            println!("{rendered}");
        }
        Ok(report) => println!("{}", report.render()),
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the document store isn't reachable. Check the \
                     source_config/sink_config URLs, and that the service is actually up. \
                     Even servers need a nudge sometimes. ☕"
                );
            }

            std::process::exit(1);
        }
    }

    Ok(())
}
