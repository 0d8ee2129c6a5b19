//! Batch overview: volume, source mix and covered time range.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use triage_core::CanonicalRecord;

use crate::schema::TIMESTAMP_FORMAT;

const MAX_LISTED_SOURCES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DateRange {
    Range { start: String, end: String },
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSummary {
    pub total_feedback: usize,
    pub unique_sources: usize,
    /// Most frequent first; capped at ten entries when `sources_truncated` is set.
    pub source_counts: Vec<SourceCount>,
    pub sources_truncated: bool,
    pub date_range: Option<DateRange>,
}

pub fn summarize(records: &[CanonicalRecord]) -> DataSummary {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.source.as_str()).or_default() += 1;
    }
    let unique_sources = counts.len();

    let mut source_counts = counts
        .into_iter()
        .map(|(source, count)| SourceCount {
            source: source.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    source_counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
    let sources_truncated = source_counts.len() > MAX_LISTED_SOURCES;
    source_counts.truncate(MAX_LISTED_SOURCES);

    DataSummary {
        total_feedback: records.len(),
        unique_sources,
        source_counts,
        sources_truncated,
        date_range: date_range(records),
    }
}

fn date_range(records: &[CanonicalRecord]) -> Option<DateRange> {
    if records.is_empty() {
        return None;
    }
    let parsed = records
        .iter()
        .map(|r| parse_timestamp(&r.timestamp))
        .collect::<Option<Vec<_>>>();
    let Some(parsed) = parsed else {
        return Some(DateRange::Unparseable);
    };
    let start = parsed.iter().min()?;
    let end = parsed.iter().max()?;
    Some(DateRange::Range {
        start: start.format(TIMESTAMP_FORMAT).to_string(),
        end: end.format(TIMESTAMP_FORMAT).to_string(),
    })
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%d %B %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}
