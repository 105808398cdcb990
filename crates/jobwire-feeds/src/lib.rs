//! Feed fetching and normalization.
//!
//! Downloads job feeds over HTTP and flattens the three XML shapes seen in
//! the wild (`rss > channel > item`, `feed > entry`, `channel > item`) into
//! canonical [`JobRecord`]s. Field aliases are resolved per dialect and every
//! record is guaranteed a non-empty external id.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use jobwire_core::JobRecord;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("feed {url} returned HTTP {status}")]
    HttpStatus { status: u16, url: String },
    #[error("feed parse error: {0}")]
    Parse(String),
}

/// Element paths under which one feed item lives, per dialect.
const ITEM_PATHS: &[&[&str]] = &[
    &["rss", "channel", "item"],
    &["feed", "entry"],
    &["channel", "item"],
];

/// Alias chain for one canonical field: earlier keys win, `default` applies
/// when every key is missing or empty.
struct FieldAliases {
    keys: &'static [&'static str],
    default: &'static str,
}

const TITLE: FieldAliases = FieldAliases {
    keys: &["title", "summary"],
    default: "No Title",
};
const COMPANY: FieldAliases = FieldAliases {
    keys: &["job:company", "company", "author"],
    default: "Unknown",
};
const LOCATION: FieldAliases = FieldAliases {
    keys: &["job:location", "location", "job:region"],
    default: "Remote",
};
const DESCRIPTION: FieldAliases = FieldAliases {
    keys: &["description", "content", "summary"],
    default: "",
};
const CATEGORY: FieldAliases = FieldAliases {
    keys: &["job:category", "category"],
    default: "General",
};
const JOB_TYPE: FieldAliases = FieldAliases {
    keys: &["job:type", "type"],
    default: "Full-time",
};

const IDENTITY_KEYS: &[&str] = &["guid", "id", "link", "title"];
const TIMESTAMP_KEYS: &[&str] = &["pubDate", "published"];

impl FieldAliases {
    fn resolve(&self, item: &BTreeMap<String, String>) -> String {
        for key in self.keys {
            if let Some(value) = item.get(*key) {
                if !value.is_empty() {
                    return value.clone();
                }
            }
        }
        self.default.to_string()
    }
}

/// One fetched feed, normalized: canonical records plus the raw flattened
/// items they came from, in feed order.
#[derive(Debug, Clone)]
pub struct NormalizedFeed {
    pub records: Vec<JobRecord>,
    pub raw_items: Vec<JsonValue>,
}

/// HTTP client for feed downloads.
pub struct FeedClient {
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Fetches `feed_url` and normalizes its items.
    pub async fn normalize(&self, feed_url: &str) -> Result<NormalizedFeed, FeedError> {
        let response = self.client.get(feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                url: feed_url.to_string(),
            });
        }
        let body = response.text().await?;
        let items = parse_feed_items(&body)?;
        tracing::debug!(feed = feed_url, items = items.len(), "parsed feed");
        Ok(normalize_items(items, feed_url, Utc::now()))
    }
}

/// Flattens `xml` into one string map per feed item, in document order.
///
/// Only direct children of an item element are captured; the first
/// occurrence of a child name wins. An Atom `<link href="..">` with no text
/// content yields its `href`. A document whose root element belongs to none
/// of the known dialects is rejected as unrecognized; a recognized feed with
/// zero items parses to an empty list.
pub fn parse_feed_items(xml: &str) -> Result<Vec<BTreeMap<String, String>>, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut root_seen = false;
    let mut path: Vec<String> = Vec::new();
    let mut item_depth: Option<usize> = None;
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    let mut field: Option<String> = None;
    let mut field_text = String::new();
    let mut field_href: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = qualified_name(&e);
                if !root_seen {
                    root_seen = true;
                    if !ITEM_PATHS.iter().any(|p| p[0] == name) {
                        return Err(FeedError::Parse(format!(
                            "unrecognized feed root element <{name}>"
                        )));
                    }
                }
                if item_depth.is_none() {
                    path.push(name);
                    if ITEM_PATHS.iter().any(|p| path_matches(&path, p)) {
                        item_depth = Some(path.len());
                        current = BTreeMap::new();
                    }
                } else {
                    if path.len() == item_depth.unwrap_or(0) {
                        field = Some(name.clone());
                        field_text.clear();
                        field_href = href_attribute(&e, &reader);
                    }
                    path.push(name);
                }
            }
            Ok(Event::Empty(e)) => {
                if item_depth.is_some() && path.len() == item_depth.unwrap_or(0) {
                    let name = qualified_name(&e);
                    let value = href_attribute(&e, &reader).unwrap_or_default();
                    current.entry(name).or_insert(value);
                }
            }
            Ok(Event::Text(t)) => {
                if field.is_some() && path.len() == item_depth.unwrap_or(0) + 1 {
                    let text = t
                        .unescape()
                        .map_err(|err| FeedError::Parse(err.to_string()))?;
                    field_text.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if field.is_some() && path.len() == item_depth.unwrap_or(0) + 1 {
                    field_text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
                if let Some(depth) = item_depth {
                    if path.len() == depth {
                        if let Some(name) = field.take() {
                            let value = if field_text.is_empty() {
                                field_href.take().unwrap_or_default()
                            } else {
                                std::mem::take(&mut field_text)
                            };
                            current.entry(name).or_insert(value);
                        }
                        field_href = None;
                    } else if path.len() == depth - 1 {
                        items.push(std::mem::take(&mut current));
                        item_depth = None;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(FeedError::Parse(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

fn qualified_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn href_attribute(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Option<String> {
    let decoder = reader.decoder();
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"href" {
            if let Ok(value) = attr.decode_and_unescape_value(decoder) {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Maps flattened items to canonical records. `fetched_at` backs any item
/// without a parseable timestamp.
pub fn normalize_items(
    items: Vec<BTreeMap<String, String>>,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> NormalizedFeed {
    let mut records = Vec::with_capacity(items.len());
    let mut raw_items = Vec::with_capacity(items.len());
    for item in items {
        records.push(normalize_item(&item, source, fetched_at));
        raw_items.push(JsonValue::Object(
            item.into_iter()
                .map(|(k, v)| (k, JsonValue::String(v)))
                .collect(),
        ));
    }
    NormalizedFeed { records, raw_items }
}

fn normalize_item(
    item: &BTreeMap<String, String>,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> JobRecord {
    let title = TITLE.resolve(item);
    let url = non_empty(item, "link")
        .or_else(|| non_empty(item, "id"))
        .unwrap_or_default();
    let external_id = IDENTITY_KEYS
        .iter()
        .find_map(|key| non_empty(item, key))
        .unwrap_or_else(|| synthesize_external_id(&title));
    let created_at = TIMESTAMP_KEYS
        .iter()
        .find_map(|key| item.get(*key).and_then(|v| parse_feed_timestamp(v)))
        .unwrap_or(fetched_at);

    let raw = JsonValue::Object(
        item.iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    );

    JobRecord {
        external_id,
        title,
        company: COMPANY.resolve(item),
        location: LOCATION.resolve(item),
        url,
        description: DESCRIPTION.resolve(item),
        category: CATEGORY.resolve(item),
        job_type: JOB_TYPE.resolve(item),
        source: source.to_string(),
        created_at,
        updated_at: fetched_at,
        raw,
    }
}

fn non_empty(item: &BTreeMap<String, String>, key: &str) -> Option<String> {
    item.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Weak fallback identity for items with no guid, id, link or title. Unique
/// per call, so such an item can never match an existing job.
fn synthesize_external_id(title: &str) -> String {
    let stem = if title.is_empty() || title == TITLE.default {
        "job"
    } else {
        title
    };
    format!("{}-{}-{}", stem, Utc::now().timestamp_millis(), Uuid::new_v4())
}

fn parse_feed_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn path_matches(path: &[String], wanted: &[&str]) -> bool {
    path.len() == wanted.len() && path.iter().zip(wanted).all(|(a, b)| a == b)
}
