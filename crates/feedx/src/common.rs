// ai
//! 📦 Common data structures: the building blocks of feedx.
//!
//! 🎬 COLD OPEN: INT. STUDENT UNION. 11:58 PM.
//!
//! Somebody just posted a blurry photo of the dining hall pizza. Forty people liked it
//! in ninety seconds. The backing store shrugged and handed us a loose JSON map with
//! `likes` as an array, `commentCount` as a number, and a `timestamp` that is either
//! epoch millis, an RFC 3339 string, or a `{seconds, nanoseconds}` object depending on
//! which screen wrote it. We do not ask which. We parse.
//!
//! This module is the customs desk at the subscription boundary. Loose [`Record`]s come
//! in, strongly typed [`ContentItem`]s, [`AuthorProfile`]s and [`ViewerContext`]s go out.
//! Absent optional fields get explicit defaults here, so nobody downstream has to guess
//! what `undefined || 0` meant at 2am. 🦆

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 🗺️ A raw document as the backing store hands it over: a loose JSON object.
/// Every record that leaves a collaborator carries its document id under `"id"`.
pub type Record = serde_json::Map<String, Value>;

// ============================================================
// 🎨 ContentType
// ============================================================

/// 🎨 What shape of post are we looking at.
///
/// The variant order doubles as the quality modifier order: image beats video beats
/// text beats link. The scorer leans on that, so think twice before reshuffling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Image,
    Video,
    Text,
    Link,
}

// ============================================================
// 📰 ContentItem
// ============================================================

/// 📰 One post, frozen at read time.
///
/// Created by the backing store, never mutated by the core. When a subscription
/// delivers a new batch, the whole batch of items is replaced. No partial patching,
/// no surgery, no regrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContentItem {
    pub id: String,
    pub author_id: Option<String>,
    /// `None` when the record had no parseable timestamp. Scores to zero.
    pub created_at: Option<DateTime<Utc>>,
    pub text: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub link_url: Option<String>,
    pub like_count: u64,
    pub comment_count: u64,
    pub share_count: u64,
    pub views: Option<u64>,
    /// 💬 Comment bodies, when the record embeds them. Used for the "substantive comment" count.
    pub comments: Vec<String>,
    pub hashtags: Vec<String>,
    pub is_repost: bool,
    pub original_item_id: Option<String>,
    /// 🏫 The school the post was made from, when the record says so.
    pub affiliation: Option<String>,
}

impl ContentItem {
    /// 🛃 Convert a loose record into a `ContentItem`.
    ///
    /// Returns `None` only when the record has no usable `id`, because an item we cannot
    /// name is an item we cannot rank. Everything else defaults explicitly:
    /// counters to 0, collections to empty, flags to false, timestamp to `None`.
    pub fn from_record(record: &Record) -> Option<Self> {
        let id = string_field(record, &["id"])?;

        // -- 🧮 counters: a number field wins, an array's length is the fallback
        let like_count = count_field(record, "likeCount", "likes");
        let comment_count = count_field(record, "commentCount", "comments");
        let share_count = count_field(record, "shareCount", "shares");

        let comments = record
            .get("comments")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(comment_body).collect())
            .unwrap_or_default();

        let hashtags = record
            .get("hashtags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(normalize_tag)
                    .filter(|tag| !tag.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id,
            author_id: string_field(record, &["userId", "authorId"]),
            created_at: timestamp_field(record, &["timestamp", "createdAt"]),
            text: string_field(record, &["text"]).unwrap_or_default(),
            image_url: string_field(record, &["image", "imageUrl"]),
            video_url: string_field(record, &["video", "videoUrl"]),
            link_url: string_field(record, &["link", "linkUrl", "url"]),
            like_count,
            comment_count,
            share_count,
            views: record.get("views").and_then(as_count),
            comments,
            hashtags,
            is_repost: record
                .get("isRepost")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            original_item_id: string_field(record, &["originalPostId", "originalItemId"]),
            affiliation: string_field(record, &["school", "university"]),
        })
    }

    /// 🎨 Image beats video beats link beats plain text when deciding what this post "is".
    pub fn content_type(&self) -> ContentType {
        if self.image_url.is_some() {
            ContentType::Image
        } else if self.video_url.is_some() {
            ContentType::Video
        } else if self.link_url.is_some() {
            ContentType::Link
        } else {
            ContentType::Text
        }
    }

    /// 📸 Does this post carry an image or a video?
    pub fn has_media(&self) -> bool {
        self.image_url.is_some() || self.video_url.is_some()
    }

    /// 💯 likes + comments + shares, saturating. Views are not engagement, they are just looking.
    pub fn total_engagement(&self) -> u64 {
        self.like_count
            .saturating_add(self.comment_count)
            .saturating_add(self.share_count)
    }

    /// ⏱️ Hours between creation and `now`. Negative when the post is from the future
    /// (clock skew happens, it's a campus, not a physics lab). `None` without a timestamp.
    pub fn age_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.created_at
            .map(|created| (now - created).num_milliseconds() as f64 / 3_600_000.0)
    }

    /// 🔢 Creation instant as epoch millis, 0 when unknown. Raw-field sorts use this.
    pub fn timestamp_millis(&self) -> i64 {
        self.created_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

// ============================================================
// 👤 AuthorProfile
// ============================================================

/// 👤 The bits of a user profile the feed cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthorProfile {
    pub id: String,
    pub display_name: String,
    /// 🏫 `university`, falling back to `school`.
    pub affiliation: Option<String>,
    pub photo_url: Option<String>,
}

impl AuthorProfile {
    /// 🛃 Parse a `users` record. The id comes from the record, or from the caller
    /// when the store returned a bare document body.
    pub fn from_record(id: &str, record: &Record) -> Self {
        let first = string_field(record, &["firstName"]);
        let last = string_field(record, &["lastName"]);
        let display_name = match (first, last) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first,
            _ => string_field(record, &["username", "name"])
                .unwrap_or_else(|| "Anonymous".to_string()),
        };

        Self {
            id: string_field(record, &["id", "uid"]).unwrap_or_else(|| id.to_string()),
            display_name,
            affiliation: string_field(record, &["university", "school"]),
            photo_url: string_field(record, &["photoURL", "photoUrl"]),
        }
    }
}

// ============================================================
// 👀 ViewerContext
// ============================================================

/// 👀 The person the feed is being ranked for. Read-only input to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewerContext {
    pub viewer_id: String,
    pub following: HashSet<String>,
    /// 🤝 How many times the viewer interacted with each author. Sparse.
    pub interactions: HashMap<String, u32>,
    pub interests: HashSet<String>,
    pub affiliation: Option<String>,
}

impl ViewerContext {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            ..Self::default()
        }
    }

    pub fn following<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.following.extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn interaction(mut self, author_id: impl Into<String>, count: u32) -> Self {
        self.interactions.insert(author_id.into(), count);
        self
    }

    pub fn interests<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.interests
            .extend(tags.into_iter().map(|tag| normalize_tag(tag.as_ref())));
        self
    }

    pub fn affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliation = Some(affiliation.into());
        self
    }

    /// 🛃 Build a viewer from a `users` record: `following` (array of ids),
    /// `interactions` (map of author id to count), `interests` (array of tags),
    /// `university` / `school`.
    pub fn from_record(viewer_id: &str, record: &Record) -> Self {
        let following = record
            .get("following")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        let interactions = record
            .get("interactions")
            .and_then(Value::as_object)
            .map(|counts| {
                counts
                    .iter()
                    .filter_map(|(author, count)| {
                        as_count(count).map(|c| (author.clone(), c.min(u32::MAX as u64) as u32))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let interests = record
            .get("interests")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).map(normalize_tag).collect())
            .unwrap_or_default();

        Self {
            viewer_id: viewer_id.to_string(),
            following,
            interactions,
            interests,
            affiliation: string_field(record, &["university", "school"]),
        }
    }
}

// ============================================================
// 🔀 OrderingMode
// ============================================================

/// 🔀 How the caller wants the feed ordered.
///
/// `Relevance` and `SameAffiliation` run the scorer. The rest are raw-field sorts and
/// skip scoring entirely, because computing six sub-scores to then sort by like count
/// would be a very expensive way to sort by like count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingMode {
    #[default]
    Relevance,
    Recency,
    MostLiked,
    MostCommented,
    OldestFirst,
    SameAffiliation,
}

impl OrderingMode {
    /// 🧮 Does this mode need the Score Calculator?
    pub fn needs_scoring(self) -> bool {
        matches!(self, OrderingMode::Relevance | OrderingMode::SameAffiliation)
    }
}

impl FromStr for OrderingMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        // -- 🏷️ the old sort-option names from the dropdown are welcome too
        match raw.trim().to_ascii_lowercase().as_str() {
            "relevance" | "relevant" => Ok(Self::Relevance),
            "recency" | "recent" => Ok(Self::Recency),
            "most-liked" | "liked" => Ok(Self::MostLiked),
            "most-commented" | "commented" => Ok(Self::MostCommented),
            "oldest-first" | "oldest" => Ok(Self::OldestFirst),
            "same-affiliation" | "myschool" => Ok(Self::SameAffiliation),
            other => Err(format!(
                "💀 '{other}' is not an ordering mode. Try relevance, recency, most-liked, \
                 most-commented, oldest-first or same-affiliation."
            )),
        }
    }
}

impl fmt::Display for OrderingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relevance => "relevance",
            Self::Recency => "recency",
            Self::MostLiked => "most-liked",
            Self::MostCommented => "most-commented",
            Self::OldestFirst => "oldest-first",
            Self::SameAffiliation => "same-affiliation",
        };
        f.write_str(name)
    }
}

// ============================================================
// 🔑 SubscriptionKey
// ============================================================

/// ↕️ Sort direction for a collection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

/// 🔑 The composite identity of a live subscription.
///
/// Two requests with equal keys are the same subscription. At most one may be active
/// per key. Filters live in a `BTreeMap` so `{a, b}` and `{b, a}` hash the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub collection: String,
    pub order_by_field: String,
    pub direction: Direction,
    pub limit: usize,
    /// Equality filters: field name to expected value (compared as text).
    pub filters: BTreeMap<String, String>,
}

impl SubscriptionKey {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by_field: "createdAt".to_string(),
            direction: Direction::Desc,
            limit: 50,
            filters: BTreeMap::new(),
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by_field = field.into();
        self.direction = direction;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// 🪪 Stable human-readable signature, handy for logs and cache keys.
    pub fn signature(&self) -> String {
        let filters = self
            .filters
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}:{:?}|{}|{}",
            self.collection, self.order_by_field, self.direction, self.limit, filters
        )
    }
}

/// 📄 A one-shot (non-live) collection query, used for paginated fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionQuery {
    pub order_by_field: String,
    pub direction: Direction,
    pub limit: usize,
    pub offset: usize,
    pub filters: BTreeMap<String, String>,
}

impl From<&SubscriptionKey> for CollectionQuery {
    fn from(key: &SubscriptionKey) -> Self {
        Self {
            order_by_field: key.order_by_field.clone(),
            direction: key.direction,
            limit: key.limit,
            offset: 0,
            filters: key.filters.clone(),
        }
    }
}

// ============================================================
// 🔧 record field helpers
// ============================================================

/// 🏷️ Hashtags and interests compare case-insensitively, without the leading `#`.
pub(crate) fn normalize_tag(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_lowercase()
}

/// 🔍 First non-empty string among `keys`. Numbers are stringified, because some ids are.
pub(crate) fn string_field(record: &Record, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// 🔢 Non-negative integer out of a JSON number. Floats are truncated, negatives rejected.
fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
}

/// 🧮 `number_key` if it is a number, else the array length (or number) under `array_key`.
fn count_field(record: &Record, number_key: &str, array_key: &str) -> u64 {
    if let Some(count) = record.get(number_key).and_then(as_count) {
        return count;
    }
    match record.get(array_key) {
        Some(Value::Array(entries)) => entries.len() as u64,
        Some(other) => as_count(other).unwrap_or(0),
        None => 0,
    }
}

/// 💬 A comment is either a bare string or an object with a `text` field.
fn comment_body(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) => Some(s.clone()),
        Value::Object(fields) => fields.get("text").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// ⏰ First parseable timestamp among `keys`.
fn timestamp_field(record: &Record, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|key| record.get(*key).and_then(parse_timestamp))
}

/// ⏰ Epoch millis, RFC 3339, or a `{seconds, nanoseconds}` object. Anything else is garbage.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Object(fields) => {
            let seconds = fields
                .get("seconds")
                .or_else(|| fields.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = fields
                .get("nanoseconds")
                .or_else(|| fields.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos.min(999_999_999) as u32).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            not_an_object => panic!("💀 test fixture must be an object, got {not_an_object}"),
        }
    }

    #[test]
    fn the_one_where_arrays_and_numbers_both_count_as_counters() {
        let item = ContentItem::from_record(&record(json!({
            "id": "p1",
            "userId": "alice",
            "likes": ["bob", "carol", "dan"],
            "commentCount": 2,
            "comments": [{"text": "nice"}, "also nice", 42],
            "shares": 4,
            "timestamp": 1_700_000_000_000_i64,
        })))
        .expect("💀 record with an id should parse");

        assert_eq!(item.like_count, 3, "likes array length is the fallback count");
        assert_eq!(item.comment_count, 2, "commentCount number wins over the array");
        assert_eq!(item.share_count, 4);
        assert_eq!(item.comments, vec!["nice".to_string(), "also nice".to_string()]);
        assert_eq!(item.author_id.as_deref(), Some("alice"));
        assert_eq!(item.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn the_one_where_every_timestamp_dialect_is_understood() {
        let millis = parse_timestamp(&json!(1_700_000_000_000_i64));
        let rfc = parse_timestamp(&json!("2023-11-14T22:13:20Z"));
        let firestore = parse_timestamp(&json!({"seconds": 1_700_000_000, "nanoseconds": 0}));

        assert!(millis.is_some());
        assert_eq!(millis, rfc);
        assert_eq!(rfc, firestore);
        assert_eq!(parse_timestamp(&json!("last tuesday-ish")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn the_one_where_missing_fields_get_explicit_defaults() {
        let item = ContentItem::from_record(&record(json!({"id": "bare"})))
            .expect("💀 an id is all it takes");
        assert_eq!(item.like_count, 0);
        assert_eq!(item.views, None);
        assert!(item.hashtags.is_empty());
        assert!(!item.is_repost);
        assert_eq!(item.created_at, None);
        assert_eq!(item.content_type(), ContentType::Text);

        assert!(ContentItem::from_record(&record(json!({"text": "who am i"}))).is_none());
    }

    #[test]
    fn the_one_where_reposts_and_hashtags_survive_parsing() {
        let item = ContentItem::from_record(&record(json!({
            "id": "r1",
            "isRepost": true,
            "originalPostId": "p9",
            "hashtags": ["#Finals", "coffee", "  "],
            "image": "https://img/1.jpg",
            "school": "State U",
        })))
        .expect("💀 repost should parse");

        assert!(item.is_repost);
        assert_eq!(item.original_item_id.as_deref(), Some("p9"));
        assert_eq!(item.hashtags, vec!["finals".to_string(), "coffee".to_string()]);
        assert_eq!(item.content_type(), ContentType::Image);
        assert_eq!(item.affiliation.as_deref(), Some("State U"));
    }

    #[test]
    fn the_one_where_profiles_and_viewers_come_out_of_user_records() {
        let user = record(json!({
            "firstName": "Ada",
            "lastName": "Lovelace",
            "university": "Analytical Engine Tech",
            "following": ["bob", "carol"],
            "interactions": {"bob": 7, "carol": 1.0},
            "interests": ["#Math", "Looms"],
        }));

        let profile = AuthorProfile::from_record("ada", &user);
        assert_eq!(profile.id, "ada");
        assert_eq!(profile.display_name, "Ada Lovelace");
        assert_eq!(profile.affiliation.as_deref(), Some("Analytical Engine Tech"));

        let viewer = ViewerContext::from_record("ada", &user);
        assert!(viewer.following.contains("bob"));
        assert_eq!(viewer.interactions.get("bob"), Some(&7));
        assert_eq!(viewer.interactions.get("carol"), Some(&1));
        assert!(viewer.interests.contains("math"));
        assert!(viewer.interests.contains("looms"));
    }

    #[test]
    fn the_one_where_ordering_modes_answer_to_their_old_names() {
        assert_eq!("myschool".parse::<OrderingMode>(), Ok(OrderingMode::SameAffiliation));
        assert_eq!("Most-Liked".parse::<OrderingMode>(), Ok(OrderingMode::MostLiked));
        assert!("chaos".parse::<OrderingMode>().is_err());
        assert!(OrderingMode::Relevance.needs_scoring());
        assert!(!OrderingMode::OldestFirst.needs_scoring());
        assert_eq!(OrderingMode::MostCommented.to_string(), "most-commented");
    }

    #[test]
    fn the_one_where_filter_order_does_not_change_the_key() {
        let a = SubscriptionKey::new("posts").filter("school", "X").filter("userId", "u1");
        let b = SubscriptionKey::new("posts").filter("userId", "u1").filter("school", "X");
        assert_eq!(a, b);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a, b.clone().limit(10));
    }
}
