// ai
//! 🧮 Scoring: the part of feedx that decides which post you see first.
//!
//! 🎬 COLD OPEN: INT. RESIDENCE HALL. FINALS WEEK. 3:12 AM.
//!
//! Two posts walk into a feed. One is a thoughtful 300 character essay about the
//! library closing early, with a photo, posted by someone you follow. The other says
//! "CLICK HERE FOR FREE MONEY" and was posted three days ago to absolute silence.
//! The scorer looks at both. The scorer has a job to do. 🦆
//!
//! `score(item, viewer?) -> ScoreBreakdown` is a pure function of `(item, viewer, now)`.
//! No I/O. No state. "Now" is read once per call from the injected [`Clock`] and used by
//! every sub-score, so a breakdown is always internally consistent.
//!
//! ## The six sub-scores 📐
//!
//! ```text
//!   engagement      likes·w + comments·w + shares·w + views·w + velocity·w
//!   quality        (length sweet spot + media bonus + substantive comments) × type modifier
//!   personalization following bonus + ln(1 + interactions)·w + interest matches·w
//!   recency         fresh bonus (linear to 0 at window edge) + scale / (age + 1)^decay
//!   viral           0, or viral_weight × min(ratio / threshold, cap) once ratio > threshold
//!   penalties       −spam matches·w − stale zero-engagement penalty
//!   ─────────────────────────────────────────────────────────
//!   final           max(0, sum)
//! ```
//!
//! A record with no parseable timestamp scores an all-zero breakdown. Nothing is thrown.

pub mod weights;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::common::{ContentItem, ContentType, ViewerContext, normalize_tag};
pub use weights::ScoringConfig;

/// 📊 Six named sub-scores plus the floor-clamped final score.
///
/// Produced fresh on every call. Never persisted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ScoreBreakdown {
    pub engagement: f64,
    pub quality: f64,
    pub personalization: f64,
    pub recency: f64,
    pub viral: f64,
    /// Always <= 0.
    pub penalties: f64,
    pub final_score: f64,
}

impl ScoreBreakdown {
    /// 🧾 Assemble a breakdown and compute the clamped final score.
    fn from_parts(
        engagement: f64,
        quality: f64,
        personalization: f64,
        recency: f64,
        viral: f64,
        penalties: f64,
    ) -> Self {
        let sum = engagement + quality + personalization + recency + viral + penalties;
        Self {
            engagement,
            quality,
            personalization,
            recency,
            viral,
            penalties,
            // -- 🛡️ floor at zero, no ceiling. NaN also lands on the floor.
            final_score: if sum > 0.0 { sum } else { 0.0 },
        }
    }
}

/// 🧮 The Score Calculator. Holds weights and a clock, nothing else.
#[derive(Debug, Clone)]
pub struct ScoreCalculator {
    config: ScoringConfig,
    /// 🔡 spam patterns, lowercased once so we don't lowercase them per post
    spam_patterns: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl ScoreCalculator {
    pub fn new(config: ScoringConfig, clock: Arc<dyn Clock>) -> Self {
        let spam_patterns = config
            .spam_patterns
            .iter()
            .map(|pattern| pattern.trim().to_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        Self {
            config,
            spam_patterns,
            clock,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// 🎯 Score an item for an optional viewer, as of the clock's "now".
    pub fn score(&self, item: &ContentItem, viewer: Option<&ViewerContext>) -> ScoreBreakdown {
        self.score_at(item, viewer, self.clock.now())
    }

    /// 🎯 Score an item as of an explicit instant. Same inputs, same output, always.
    pub fn score_at(
        &self,
        item: &ContentItem,
        viewer: Option<&ViewerContext>,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let Some(age_hours) = item.age_hours(now) else {
            // 💀 no timestamp, no score. the item still exists, it just sits at the bottom.
            return ScoreBreakdown::default();
        };

        ScoreBreakdown::from_parts(
            self.engagement(item, age_hours),
            self.quality(item),
            viewer.map_or(0.0, |viewer| self.personalization(item, viewer)),
            self.recency(age_hours),
            self.viral(item),
            self.penalties(item, age_hours),
        )
    }

    /// 💯 Weighted counters plus engagement velocity (per hour, 0 when age <= 0).
    fn engagement(&self, item: &ContentItem, age_hours: f64) -> f64 {
        let c = &self.config;
        let velocity = if age_hours > 0.0 {
            item.total_engagement() as f64 / age_hours
        } else {
            0.0
        };

        c.like_weight * item.like_count as f64
            + c.comment_weight * item.comment_count as f64
            + c.share_weight * item.share_count as f64
            + c.view_weight * item.views.unwrap_or(0) as f64
            + c.velocity_weight * velocity
    }

    /// ✍️ Content-shape heuristic, scaled by what kind of post this is.
    fn quality(&self, item: &ContentItem) -> f64 {
        let c = &self.config;
        let length = item.text.trim().chars().count();

        let mut quality = 0.0;
        if (c.sweet_spot_min_chars..=c.sweet_spot_max_chars).contains(&length) {
            quality += c.length_bonus;
        }
        if item.has_media() {
            quality += c.media_bonus;
        }
        let substantive = item
            .comments
            .iter()
            .filter(|body| body.trim().chars().count() > c.substantive_comment_chars)
            .count();
        quality += substantive as f64 * c.substantive_comment_bonus;

        quality * self.type_modifier(item.content_type())
    }

    fn type_modifier(&self, content_type: ContentType) -> f64 {
        match content_type {
            ContentType::Image => self.config.image_modifier,
            ContentType::Video => self.config.video_modifier,
            ContentType::Text => self.config.text_modifier,
            ContentType::Link => self.config.link_modifier,
        }
    }

    /// 👀 Following bonus, log-damped interaction history, and shared interests.
    fn personalization(&self, item: &ContentItem, viewer: &ViewerContext) -> f64 {
        let c = &self.config;
        let mut score = 0.0;

        if let Some(author) = item.author_id.as_deref() {
            if viewer.following.contains(author) {
                score += c.following_bonus;
            }
            let interactions = viewer.interactions.get(author).copied().unwrap_or(0);
            score += c.interaction_weight * (1.0 + interactions as f64).ln();
        }

        if !item.hashtags.is_empty() && !viewer.interests.is_empty() {
            let interests: HashSet<String> =
                viewer.interests.iter().map(|tag| normalize_tag(tag)).collect();
            let matches = item
                .hashtags
                .iter()
                .map(|tag| normalize_tag(tag))
                .collect::<HashSet<_>>()
                .intersection(&interests)
                .count();
            score += matches as f64 * c.interest_match_bonus;
        }

        score
    }

    /// ⏱️ Strictly decreasing in age.
    ///
    /// The power-law decay term `recency_scale / (age + 1)^decay_exponent` is added at every
    /// age, including inside the fresh window. Inside the window the linear fresh bonus is
    /// stacked on top of it, so a brand-new post gets both.
    fn recency(&self, age_hours: f64) -> f64 {
        let c = &self.config;
        // -- 🔮 posts from the future are treated as brand new, not as extra fresh
        let age = age_hours.max(0.0);

        let fresh = if c.fresh_window_hours > 0.0 && age < c.fresh_window_hours {
            c.fresh_bonus * (1.0 - age / c.fresh_window_hours)
        } else {
            0.0
        };
        fresh + c.recency_scale / (age + 1.0).powf(c.decay_exponent)
    }

    /// 🔥 Only posts engaging a suspiciously large share of their viewers go viral.
    fn viral(&self, item: &ContentItem) -> f64 {
        let c = &self.config;
        let engagement = item.total_engagement();
        if engagement == 0 {
            return 0.0;
        }

        let estimated_views = match item.views {
            Some(views) if views > 0 => views,
            _ => engagement.saturating_mul(c.view_estimate_multiplier).max(1),
        };
        let ratio = engagement as f64 / estimated_views as f64;
        if ratio > c.viral_threshold {
            c.viral_weight * (ratio / c.viral_threshold).min(c.viral_cap)
        } else {
            0.0
        }
    }

    /// 🚫 Spam matches and the stale-and-ignored penalty. Returned as a value <= 0.
    fn penalties(&self, item: &ContentItem, age_hours: f64) -> f64 {
        let c = &self.config;
        let mut penalty = self.spam_matches(&item.text) as f64 * c.spam_penalty;
        if age_hours > c.stale_after_hours && item.total_engagement() == 0 {
            penalty += c.stale_penalty;
        }
        -penalty
    }

    /// 🕵️ How many distinct block-listed patterns appear in `text` (case-insensitive).
    pub fn spam_matches(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let haystack = text.to_lowercase();
        self.spam_patterns
            .iter()
            .filter(|pattern| haystack.contains(pattern.as_str()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("💀 fixture timestamp must parse")
            .with_timezone(&Utc)
    }

    fn calculator() -> ScoreCalculator {
        ScoreCalculator::new(ScoringConfig::default(), Arc::new(ManualClock::new(now())))
    }

    fn item_aged(id: &str, age: TimeDelta) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            author_id: Some("author".to_string()),
            created_at: Some(now() - age),
            ..ContentItem::default()
        }
    }

    #[test]
    fn the_one_where_more_engagement_never_scores_lower() {
        let scorer = calculator();
        let mut quiet = item_aged("quiet", TimeDelta::hours(5));
        quiet.like_count = 3;
        quiet.comment_count = 1;
        let mut loud = quiet.clone();
        loud.like_count = 30;
        loud.comment_count = 4;
        loud.share_count = 2;

        let quiet_score = scorer.score(&quiet, None);
        let loud_score = scorer.score(&loud, None);
        assert!(loud_score.final_score >= quiet_score.final_score);
        assert!(loud_score.engagement > quiet_score.engagement);
        assert_eq!(loud_score.recency, quiet_score.recency, "same age, same recency");
    }

    #[test]
    fn the_one_where_absurd_counters_saturate_instead_of_exploding() {
        let scorer = calculator();
        let record = match serde_json::json!({
            "id": "bot-farm",
            "userId": "author",
            "likeCount": 1e30,
            "commentCount": 5,
            "shareCount": 2,
            "timestamp": (now() - TimeDelta::hours(1)).timestamp_millis(),
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let post = ContentItem::from_record(&record).expect("💀 record with an id should parse");
        assert_eq!(post.like_count, u64::MAX, "huge floats clamp to the counter ceiling");
        assert_eq!(post.total_engagement(), u64::MAX);

        let breakdown = scorer.score(&post, None);
        assert!(breakdown.final_score.is_finite());
        assert!(breakdown.engagement > 0.0);
    }

    #[test]
    fn the_one_where_time_is_not_kind_to_old_posts() {
        let scorer = calculator();
        let mut post = item_aged("post", TimeDelta::hours(3));
        post.like_count = 12;
        post.comment_count = 2;

        let fresh = scorer.score_at(&post, None, now());
        let aged = scorer.score_at(&post, None, now() + TimeDelta::hours(48));
        assert!(fresh.final_score > aged.final_score);
        assert!(fresh.recency > aged.recency);
    }

    #[test]
    fn the_one_where_fresh_posts_get_the_bonus_on_top_of_the_decay() {
        let scorer = calculator();
        let c = scorer.config();
        let decay_only = |age: f64| c.recency_scale / (age + 1.0).powf(c.decay_exponent);

        let inside = c.fresh_window_hours / 2.0;
        let expected = c.fresh_bonus * 0.5 + decay_only(inside);
        assert!((scorer.recency(inside) - expected).abs() < 1e-9);
        assert!(scorer.recency(inside) > decay_only(inside));

        let outside = c.fresh_window_hours + 1.0;
        assert!((scorer.recency(outside) - decay_only(outside)).abs() < 1e-9);
    }

    #[test]
    fn the_one_where_recency_decreases_across_the_fresh_window_edge() {
        let scorer = calculator();
        let ages = [0.0, 0.5, 1.0, 1.99, 2.0, 2.01, 6.0, 24.0, 72.0, 500.0];
        for pair in ages.windows(2) {
            assert!(
                scorer.recency(pair[0]) > scorer.recency(pair[1]),
                "recency({}) should beat recency({})",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn the_one_where_penalties_cannot_dig_below_zero() {
        let scorer = calculator();
        let mut spam = item_aged("spam", TimeDelta::hours(100));
        spam.text = "BUY NOW!!! click here for FREE MONEY, dm me for details".to_string();

        let breakdown = scorer.score(&spam, None);
        assert!(breakdown.penalties < -50.0);
        assert_eq!(breakdown.final_score, 0.0);
    }

    #[test]
    fn the_one_with_the_half_hour_old_banger_from_a_friend() {
        let scorer = calculator();
        let mut banger = item_aged("banger", TimeDelta::minutes(30));
        banger.like_count = 100;
        banger.comment_count = 10;
        let viewer = ViewerContext::new("me").following(["author"]);

        let breakdown = scorer.score(&banger, Some(&viewer));

        // 📐 engagement: 100·1 + 10·5 + velocity (110 / 0.5h)·0.5 = 260
        assert!((breakdown.engagement - 260.0).abs() < 1e-9);
        // 📐 personalization: following bonus 50 + 10·ln(1) = 50
        assert!((breakdown.personalization - 50.0).abs() < 1e-9);
        // 📐 recency: fresh 100·(1 − 0.5/2) = 75, plus 100 / 1.5^1.8 ≈ 48.1987
        assert!((breakdown.recency - 123.1987).abs() < 1e-3);
        assert_eq!(breakdown.quality, 0.0);
        assert_eq!(breakdown.viral, 0.0);
        assert_eq!(breakdown.penalties, 0.0);
        // 📐 final ≈ 433.1987
        assert!((breakdown.final_score - 433.1987).abs() < 1e-3);
    }

    #[test]
    fn the_one_where_a_three_day_old_ghost_post_fades_out() {
        let scorer = calculator();
        let ghost = item_aged("ghost", TimeDelta::hours(72));

        let breakdown = scorer.score(&ghost, None);
        assert_eq!(breakdown.penalties, -10.0, "stale + zero engagement penalty only");
        assert!(breakdown.recency > 0.0 && breakdown.recency < 0.05);
        assert_eq!(breakdown.final_score, 0.0);
    }

    #[test]
    fn the_one_where_two_spam_patterns_cost_exactly_two_penalties() {
        let scorer = calculator();
        let mut post = item_aged("promo", TimeDelta::hours(1));
        post.text = "Limited time offer on textbooks, BUY NOW".to_string();
        post.like_count = 40;

        let breakdown = scorer.score(&post, None);
        assert_eq!(scorer.spam_matches(&post.text), 2);
        assert_eq!(breakdown.penalties, -2.0 * scorer.config().spam_penalty);
        assert!(breakdown.engagement > 0.0, "other sub-scores are untouched");
    }

    #[test]
    fn the_one_where_garbage_timestamps_score_nothing_at_all() {
        let scorer = calculator();
        let mut timeless = item_aged("timeless", TimeDelta::zero());
        timeless.created_at = None;
        timeless.like_count = 1_000;

        assert_eq!(scorer.score(&timeless, None), ScoreBreakdown::default());
    }

    #[test]
    fn the_one_where_anonymous_viewers_get_no_personalization() {
        let scorer = calculator();
        let mut post = item_aged("post", TimeDelta::hours(1));
        post.hashtags = vec!["finals".to_string()];
        let viewer = ViewerContext::new("me")
            .following(["author"])
            .interaction("author", 9)
            .interests(["#Finals"]);

        let anonymous = scorer.score(&post, None);
        let known = scorer.score(&post, Some(&viewer));
        assert_eq!(anonymous.personalization, 0.0);
        // 📐 50 + 10·ln(10) + 5
        let expected = 50.0 + 10.0 * 10.0_f64.ln() + 5.0;
        assert!((known.personalization - expected).abs() < 1e-9);
        assert_eq!(anonymous.recency, known.recency);
    }

    #[test]
    fn the_one_where_images_outrank_videos_outrank_text_outrank_links() {
        let scorer = calculator();
        let mut base = item_aged("q", TimeDelta::hours(1));
        base.text = "x".repeat(120);
        base.comments = vec!["this is a genuinely thoughtful comment".to_string()];

        let mut image = base.clone();
        image.image_url = Some("img".to_string());
        let mut video = base.clone();
        video.video_url = Some("vid".to_string());
        let mut link = base.clone();
        link.link_url = Some("https://example.edu".to_string());

        let q = |item: &ContentItem| scorer.score(item, None).quality;
        assert!(q(&image) > q(&video));
        assert!(q(&video) > q(&base));
        assert!(q(&base) > q(&link));
        // 📐 text: (10 + 2) × 1.0
        assert!((q(&base) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn the_one_where_viral_is_capped_so_outliers_stay_humble() {
        let scorer = calculator();
        let mut viral = item_aged("viral", TimeDelta::hours(2));
        viral.like_count = 500;
        viral.views = Some(1_000);
        let mut meh = viral.clone();
        meh.views = Some(100_000);

        let viral_score = scorer.score(&viral, None).viral;
        let c = scorer.config();
        assert_eq!(viral_score, c.viral_weight * c.viral_cap, "ratio 0.5 / 0.1 = 5, capped at 3");
        assert_eq!(scorer.score(&meh, None).viral, 0.0);

        let mut unseen = viral.clone();
        unseen.views = None;
        assert_eq!(scorer.score(&unseen, None).viral, 0.0, "estimated views keep the ratio low");
    }

    #[test]
    fn the_one_where_the_same_inputs_give_the_same_answer() {
        let scorer = calculator();
        let mut post = item_aged("steady", TimeDelta::minutes(45));
        post.like_count = 7;
        post.text = "click here for the study group sign-up sheet please".to_string();
        let viewer = ViewerContext::new("me").interaction("author", 3);

        let first = scorer.score_at(&post, Some(&viewer), now());
        let second = scorer.score_at(&post, Some(&viewer), now());
        assert_eq!(first, second);
        assert_eq!(scorer.score(&post, Some(&viewer)), first, "injected clock reads the same now");
    }
}
