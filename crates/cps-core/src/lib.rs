//! Core domain model and merge policies for CPS.

use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cps-core";

/// Feed submission timestamps are local Hong Kong time.
const FEED_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Canonical persisted venue representation.
///
/// `programmes` is derived data: the list of non-deleted programme natural keys
/// currently referencing this venue, rebuilt by the cross-reference step each
/// sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub venue_id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub programmes: Vec<String>,
    pub deleted: bool,
}

/// Canonical persisted programme representation.
///
/// `likes` is user-mutable outside the pipeline and always carried forward on
/// re-import. `submit_epoch` is derived from the feed's local date-time string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Programme {
    pub event_id: String,
    pub title: String,
    pub venue_id: String,
    pub dateline: Option<String>,
    pub duration: Option<String>,
    pub price: Option<String>,
    pub description: Option<String>,
    pub presenter: Option<String>,
    pub programme_type: Option<String>,
    pub language: Option<String>,
    pub remarks: Option<String>,
    pub url: Option<String>,
    pub enquiry: Option<String>,
    pub likes: i64,
    pub submit_epoch: Option<i64>,
    pub deleted: bool,
}

/// Parsed handoff contract from the venue feed into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueDraft {
    pub venue_id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Parsed handoff contract from the event feed into the reconciler.
///
/// `submit_date` is the raw local date-time string; the reconciler derives the
/// epoch value from it via [`parse_submit_epoch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgrammeDraft {
    pub event_id: String,
    pub title: Option<String>,
    pub venue_id: Option<String>,
    pub dateline: Option<String>,
    pub duration: Option<String>,
    pub price: Option<String>,
    pub description: Option<String>,
    pub presenter: Option<String>,
    pub programme_type: Option<String>,
    pub language: Option<String>,
    pub remarks: Option<String>,
    pub url: Option<String>,
    pub enquiry: Option<String>,
    pub submit_date: Option<String>,
}

/// Drops empty/whitespace-only values.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Merge policy for textual fields on re-import: take the incoming value if it
/// is non-empty, otherwise retain what is already stored.
pub fn merge_text(stored: Option<String>, incoming: Option<String>) -> Option<String> {
    non_empty(incoming).or(stored)
}

/// Same policy for already-derived optional values (e.g. the submit epoch).
pub fn merge_some<T>(stored: Option<T>, incoming: Option<T>) -> Option<T> {
    incoming.or(stored)
}

/// Parses a feed-local (UTC+8) date-time string into epoch seconds.
///
/// Unparsable or absent input yields `None`, never an error.
pub fn parse_submit_epoch(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .ok()?;
    let offset = FixedOffset::east_opt(FEED_UTC_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_text_prefers_non_empty_incoming() {
        assert_eq!(
            merge_text(Some("old".into()), Some("new".into())),
            Some("new".to_string())
        );
    }

    #[test]
    fn merge_text_keeps_stored_when_incoming_empty_or_blank() {
        assert_eq!(merge_text(Some("old".into()), None), Some("old".to_string()));
        assert_eq!(
            merge_text(Some("old".into()), Some("".into())),
            Some("old".to_string())
        );
        assert_eq!(
            merge_text(Some("old".into()), Some("   ".into())),
            Some("old".to_string())
        );
    }

    #[test]
    fn merge_text_passes_through_when_nothing_stored() {
        assert_eq!(merge_text(None, Some("new".into())), Some("new".to_string()));
        assert_eq!(merge_text(None, None), None);
    }

    #[test]
    fn submit_epoch_interprets_local_time_as_utc_plus_8() {
        // 2021-06-01T11:05:33+08:00 == 2021-06-01T03:05:33Z
        assert_eq!(
            parse_submit_epoch(Some("2021-06-01 11:05:33")),
            Some(1_622_516_733)
        );
    }

    #[test]
    fn submit_epoch_accepts_minute_precision() {
        assert_eq!(
            parse_submit_epoch(Some("2021-06-01 11:05")),
            Some(1_622_516_700)
        );
    }

    #[test]
    fn submit_epoch_is_lenient_about_garbage() {
        assert_eq!(parse_submit_epoch(None), None);
        assert_eq!(parse_submit_epoch(Some("")), None);
        assert_eq!(parse_submit_epoch(Some("not a date")), None);
        assert_eq!(parse_submit_epoch(Some("2021-13-45 99:99:99")), None);
    }
}
