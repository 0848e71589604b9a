// ai
//! 🎚️ Scoring weights: every knob the Score Calculator turns, in one TOML-able struct.
//!
//! 🎬 *[a product manager asks why a post about free pizza outranked the dean's email.]*
//! *[an engineer opens this file. points at `comment_weight = 5.0`. says nothing.]* 🦆
//!
//! 🧠 Knowledge graph:
//! - Embedded in `AppConfig` under `[scoring]`, every field optional thanks to `#[serde(default)]`.
//! - The absolute numbers are vibes. The *relative* orderings are contract:
//!   image >= video >= text >= link for the content-type modifiers, and no weight may be
//!   negative (penalties are stored as positive magnitudes and subtracted by the scorer).
//!   [`ScoringConfig::validate`] enforces both before anyone ranks anything.

use anyhow::{Result, bail};
use serde::Deserialize;

/// 🎚️ All the weights, thresholds and block-lists used by [`crate::scoring::ScoreCalculator`].
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    // -- 💯 engagement
    pub like_weight: f64,
    pub comment_weight: f64,
    pub share_weight: f64,
    pub view_weight: f64,
    /// 🚀 multiplier on (likes + comments + shares) per hour since posting
    pub velocity_weight: f64,

    // -- ✍️ quality
    pub sweet_spot_min_chars: usize,
    pub sweet_spot_max_chars: usize,
    pub length_bonus: f64,
    pub media_bonus: f64,
    /// 💬 a comment longer than this many chars counts as "substantive"
    pub substantive_comment_chars: usize,
    pub substantive_comment_bonus: f64,
    pub image_modifier: f64,
    pub video_modifier: f64,
    pub text_modifier: f64,
    pub link_modifier: f64,

    // -- 👀 personalization
    pub following_bonus: f64,
    /// 🤝 multiplier on ln(1 + prior interactions with the author)
    pub interaction_weight: f64,
    pub interest_match_bonus: f64,

    // -- ⏱️ recency
    pub fresh_window_hours: f64,
    pub fresh_bonus: f64,
    pub recency_scale: f64,
    #[serde(alias = "decay")]
    pub decay_exponent: f64,

    // -- 🔥 viral
    /// engagement / views ratio that must be exceeded before anything goes viral
    pub viral_threshold: f64,
    pub viral_weight: f64,
    /// the most a viral multiplier may ever be, so one outlier can't eat the feed
    pub viral_cap: f64,
    /// views assumed per engagement when the record carries no view count
    pub view_estimate_multiplier: u64,

    // -- 🚫 penalties (positive magnitudes, subtracted)
    pub spam_patterns: Vec<String>,
    pub spam_penalty: f64,
    pub stale_after_hours: f64,
    pub stale_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            // -- 💯 a share is worth ten likes. a comment is worth five. a like is worth a like.
            like_weight: 1.0,
            comment_weight: 5.0,
            share_weight: 10.0,
            view_weight: 0.01,
            velocity_weight: 0.5,

            sweet_spot_min_chars: 50,
            sweet_spot_max_chars: 500,
            length_bonus: 10.0,
            media_bonus: 5.0,
            substantive_comment_chars: 20,
            substantive_comment_bonus: 2.0,
            image_modifier: 1.2,
            video_modifier: 1.1,
            text_modifier: 1.0,
            link_modifier: 0.8,

            following_bonus: 50.0,
            interaction_weight: 10.0,
            interest_match_bonus: 5.0,

            fresh_window_hours: 2.0,
            fresh_bonus: 100.0,
            recency_scale: 100.0,
            decay_exponent: 1.8,

            viral_threshold: 0.1,
            viral_weight: 25.0,
            viral_cap: 3.0,
            view_estimate_multiplier: 20,

            spam_patterns: [
                "buy now",
                "click here",
                "free money",
                "limited time offer",
                "dm me for",
                "follow for follow",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            spam_penalty: 20.0,
            stale_after_hours: 24.0,
            stale_penalty: 10.0,
        }
    }
}

impl ScoringConfig {
    /// 🔒 Refuse configs that break the ordering contract.
    ///
    /// Tune the numbers all you like. Flip image below link, or hand us a negative
    /// weight, and we bail before the first post gets scored.
    pub fn validate(&self) -> Result<()> {
        let modifiers = [
            ("image_modifier", self.image_modifier),
            ("video_modifier", self.video_modifier),
            ("text_modifier", self.text_modifier),
            ("link_modifier", self.link_modifier),
        ];
        for pair in modifiers.windows(2) {
            let (higher_name, higher) = pair[0];
            let (lower_name, lower) = pair[1];
            if higher < lower {
                bail!(
                    "💀 Content-type modifiers must keep image >= video >= text >= link, \
                     but {higher_name} ({higher}) < {lower_name} ({lower})."
                );
            }
        }

        let magnitudes = [
            ("like_weight", self.like_weight),
            ("comment_weight", self.comment_weight),
            ("share_weight", self.share_weight),
            ("view_weight", self.view_weight),
            ("velocity_weight", self.velocity_weight),
            ("length_bonus", self.length_bonus),
            ("media_bonus", self.media_bonus),
            ("substantive_comment_bonus", self.substantive_comment_bonus),
            ("link_modifier", self.link_modifier),
            ("following_bonus", self.following_bonus),
            ("interaction_weight", self.interaction_weight),
            ("interest_match_bonus", self.interest_match_bonus),
            ("fresh_bonus", self.fresh_bonus),
            ("recency_scale", self.recency_scale),
            ("viral_weight", self.viral_weight),
            ("spam_penalty", self.spam_penalty),
            ("stale_penalty", self.stale_penalty),
        ];
        if let Some((name, value)) = magnitudes
            .iter()
            .find(|(_, value)| !value.is_finite() || *value < 0.0)
        {
            bail!("💀 Scoring weight '{name}' must be a finite, non-negative number, got {value}.");
        }

        if self.decay_exponent <= 0.0 || !self.decay_exponent.is_finite() {
            bail!(
                "💀 decay_exponent must be positive or old posts stop getting older. Got {}.",
                self.decay_exponent
            );
        }
        if self.fresh_window_hours < 0.0 || self.viral_threshold <= 0.0 || self.viral_cap < 1.0 {
            bail!(
                "💀 fresh_window_hours must be >= 0, viral_threshold > 0 and viral_cap >= 1. \
                 Got {}, {} and {}.",
                self.fresh_window_hours,
                self.viral_threshold,
                self.viral_cap
            );
        }
        if self.sweet_spot_min_chars > self.sweet_spot_max_chars {
            bail!(
                "💀 The length sweet spot is upside down: min {} > max {}.",
                self.sweet_spot_min_chars,
                self.sweet_spot_max_chars
            );
        }
        Ok(())
    }
}
