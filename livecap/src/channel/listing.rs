//! Traversal of the channel sidebar JSON.
//!
//! Replaces object-path queries with an explicit descent: every object
//! carrying a `videoId` is examined for an upcoming-event start time or a
//! live-now badge, deduplicated by video id in discovery order.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;

const LIVE_NOW_BADGE: &str = "BADGE_STYLE_TYPE_LIVE_NOW";

/// A live or upcoming broadcast discovered in channel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEntry {
    pub video_id: String,
    pub title: String,
}

/// Collect upcoming and live-now entries from channel data.
///
/// `upcoming_window` bounds how far ahead a scheduled broadcast may start
/// to be tracked; `None` tracks anything scheduled.
pub fn collect_live_candidates(
    data: &Value,
    now: i64,
    upcoming_window: Option<Duration>,
) -> Vec<VideoEntry> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    walk(data, now, upcoming_window, &mut seen, &mut found);
    found
}

fn walk(
    value: &Value,
    now: i64,
    upcoming_window: Option<Duration>,
    seen: &mut HashSet<String>,
    found: &mut Vec<VideoEntry>,
) {
    match value {
        Value::Object(map) => {
            if let Some(video_id) = map.get("videoId").and_then(Value::as_str)
                && (is_upcoming(value, now, upcoming_window) || has_live_badge(value))
                && seen.insert(video_id.to_string())
            {
                found.push(VideoEntry {
                    video_id: video_id.to_string(),
                    title: extract_title(value),
                });
            }
            for child in map.values() {
                walk(child, now, upcoming_window, seen, found);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, now, upcoming_window, seen, found);
            }
        }
        _ => {}
    }
}

fn is_upcoming(entry: &Value, now: i64, upcoming_window: Option<Duration>) -> bool {
    let start_time = entry["upcomingEventData"]
        .get("startTime")
        .and_then(as_i64_or_str);
    match start_time {
        Some(start) if start > 0 => match upcoming_window {
            Some(window) => start <= now + window.as_secs() as i64,
            None => true,
        },
        _ => false,
    }
}

fn has_live_badge(entry: &Value) -> bool {
    entry["badges"]
        .as_array()
        .is_some_and(|badges| {
            badges.iter().any(|badge| {
                badge["metadataBadgeRenderer"]
                    .get("style")
                    .and_then(Value::as_str)
                    == Some(LIVE_NOW_BADGE)
            })
        })
}

fn extract_title(entry: &Value) -> String {
    let title = &entry["title"];
    if let Some(simple) = title.get("simpleText").and_then(Value::as_str) {
        return simple.to_string();
    }
    // Some renderers carry the title as a run list.
    title["runs"]
        .get(0)
        .and_then(|run| run.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn as_i64_or_str(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
