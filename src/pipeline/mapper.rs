use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::feed::FeedEntry;
use crate::storage::NewsRecord;

/// Fallback layout seen in hand-written feeds and the source database dumps.
const PLAIN_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Converts a feed entry into a record ready for deduplication.
///
/// Pure: the same entry and `fetched_at` always give the same record.
/// A `pubDate` that is present but unparseable is replaced by `fetched_at`;
/// an absent one stays `None`.
pub fn map_entry(entry: &FeedEntry, fetched_at: DateTime<Utc>) -> NewsRecord {
    let title = entry.title.trim();
    let link = entry.link.trim();
    let published = entry
        .published
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let published_at = published.map(|raw| {
        parse_published(raw).unwrap_or_else(|| {
            tracing::debug!(raw = raw, "Unparseable pubDate, using fetch time");
            fetched_at
        })
    });

    NewsRecord {
        dedup_key: dedup_key(link, title, published),
        title: title.to_string(),
        link: link.to_string(),
        published_at,
        summary: entry
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

/// Stable identity for a news item, as lowercase hex SHA-256.
///
/// The link identifies an item; it is compared case-insensitively and without
/// surrounding whitespace. Items without a link fall back to title and raw
/// publish date.
pub fn dedup_key(link: &str, title: &str, published: Option<&str>) -> String {
    let link = link.trim();
    let input = if link.is_empty() {
        format!(
            "title:{}|{}",
            title.trim(),
            published.map(str::trim).unwrap_or_default()
        )
    } else {
        format!("link:{}", link.to_lowercase())
    };

    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// RFC 2822 first (the RSS format), then RFC 3339, then a plain UTC datetime.
fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, PLAIN_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
