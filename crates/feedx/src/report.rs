// ai
//! 🖨️ What `feedx` prints when it's done: the ordered feed as a table, then the metrics.
//!
//! The orchestrator hands out data. This module decides how a terminal should look at it. 🦆

use chrono::{DateTime, Utc};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

use crate::common::OrderingMode;
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::RankedItem;

/// 📰 One ordered feed plus the numbers that came with it.
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub mode: OrderingMode,
    pub viewer_id: Option<String>,
    pub items: Vec<RankedItem>,
    pub metrics: MetricsSnapshot,
    /// How many ordered updates were received before the report was cut.
    pub updates_seen: usize,
    pub generated_at: DateTime<Utc>,
}

/// ✂️ Long posts get the ellipsis treatment. Counts chars, not bytes, so emoji survive.
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

impl FeedReport {
    /// 🎨 `#`, post, author, age, likes, comments, and the score (when the mode has one).
    pub fn render_feed_table(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["#", "post", "author", "age", "likes", "comments", "score", "text"]);

        for (position, ranked) in self.items.iter().enumerate() {
            let item = &ranked.item;
            let author = ranked
                .author
                .as_ref()
                .map(|profile| profile.display_name.clone())
                .or_else(|| item.author_id.clone())
                .unwrap_or_else(|| "?".to_string());
            let age = item
                .age_hours(self.generated_at)
                .map(|hours| format!("{hours:.1} h"))
                .unwrap_or_else(|| "-".to_string());
            let score = ranked
                .score
                .map(|breakdown| format!("{:.2}", breakdown.final_score))
                .unwrap_or_else(|| "-".to_string());

            table.add_row(vec![
                Cell::new(position + 1).set_alignment(CellAlignment::Right),
                Cell::new(&item.id),
                Cell::new(author),
                Cell::new(age).set_alignment(CellAlignment::Right),
                Cell::new(item.like_count).set_alignment(CellAlignment::Right),
                Cell::new(item.comment_count).set_alignment(CellAlignment::Right),
                Cell::new(score).set_alignment(CellAlignment::Right),
                Cell::new(preview(&item.text, 48)),
            ]);
        }
        table.to_string()
    }

    /// 🖨️ Headline, feed table, metrics table. The whole show.
    pub fn render(&self) -> String {
        let viewer = self.viewer_id.as_deref().unwrap_or("anonymous");
        format!(
            "📰 {} posts, ordered by {} for {viewer} (after {} update(s))\n{}\n📊 metrics\n{}",
            self.items.len(),
            self.mode,
            self.updates_seen,
            self.render_feed_table(),
            self.metrics.render_table()
        )
    }
}
