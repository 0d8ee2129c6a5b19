//! Schema inference: decides where text, source, timestamp and id come from.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use tracing::debug;
use triage_core::RawRow;

use crate::composite::CompositeDefaults;
use crate::NormalizeError;

pub const TEXT_ALIASES: &[&str] = &[
    "text",
    "feedback",
    "review",
    "comment",
    "message",
    "content",
    "description",
];
pub const COMPOSITE_COLUMN: &str = "feedback";
pub const ID_COLUMN: &str = "id";
pub const SOURCE_COLUMNS: &[&str] = &["source", "channel", "platform", "store", "Hotel_Name_City"];
pub const TIMESTAMP_COLUMNS: &[&str] = &["timestamp", "date", "date_of_review"];
pub const OVERALL_RATING_COLUMNS: &[&str] = &[
    "Review_Overall_Rating",
    "Rating_Value",
    "Overall_Rating",
    "rating",
    "score",
];
pub const REVIEW_TYPE_COLUMN: &str = "Review_Type";
pub const ASPECT_RATING_COLUMNS: &[(&str, &str)] = &[
    ("Rating_Location", "location"),
    ("Rating_Sleep_Quality", "sleep quality"),
    ("Rating_Rooms", "rooms"),
    ("Rating_Cleanliness", "cleanliness"),
    ("Rating_Service", "service"),
];

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Average rendered length a free-text column must exceed to be picked heuristically.
    pub min_text_avg_len: f64,
    pub default_source: String,
    pub timestamp_epoch: NaiveDateTime,
    pub timestamp_step: Duration,
    pub concat_separator: String,
    pub ratings_only_text: String,
    pub composite: CompositeDefaults,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            min_text_avg_len: 20.0,
            default_source: "CSV Data".to_string(),
            timestamp_epoch: NaiveDate::from_ymd_opt(2025, 10, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .expect("valid epoch"),
            timestamp_step: Duration::hours(1),
            concat_separator: " | ".to_string(),
            ratings_only_text: "Customer review with ratings only".to_string(),
            composite: CompositeDefaults::default(),
        }
    }
}

impl InferenceConfig {
    /// Timestamp for the `row_index`-th input row when no date column exists.
    pub fn synthesized_timestamp(&self, row_index: usize) -> String {
        let offset = self.timestamp_step * i32::try_from(row_index).unwrap_or(i32::MAX);
        (self.timestamp_epoch + offset)
            .format(TIMESTAMP_FORMAT)
            .to_string()
    }
}

/// Rating columns located in a ratings-only export.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RatingColumns {
    pub overall: Option<usize>,
    pub review_type: Option<usize>,
    pub aspects: Vec<(usize, &'static str)>,
}

impl RatingColumns {
    pub fn locate(columns: &[String]) -> Self {
        Self {
            overall: find_column(columns, OVERALL_RATING_COLUMNS),
            review_type: find_column(columns, &[REVIEW_TYPE_COLUMN]),
            aspects: ASPECT_RATING_COLUMNS
                .iter()
                .filter_map(|(name, label)| find_column(columns, &[*name]).map(|idx| (idx, *label)))
                .collect(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.overall.is_some() || !self.aspects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextSource {
    Column(usize),
    SynthesizeFromRatings(RatingColumns),
    ConcatenateStrings(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceField {
    Column(usize),
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    Column(usize),
    Synthesized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdField {
    Column(usize),
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularSchema {
    pub text: TextSource,
    pub source: SourceField,
    pub timestamp: TimestampField,
    pub id: IdField,
}

/// Resolved ingestion plan for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    /// The single column holds a whole encoded record per row.
    Composite { column: usize },
    Tabular(TabularSchema),
}

#[derive(Debug, Clone)]
struct ColumnProfile {
    string_typed: bool,
    avg_len: f64,
}

fn profile_columns(columns: &[String], rows: &[RawRow]) -> Vec<ColumnProfile> {
    (0..columns.len())
        .map(|idx| {
            let string_typed = rows.iter().any(|row| row.get(idx).is_text());
            let total_len: usize = rows
                .iter()
                .map(|row| row.get(idx).render().map(|s| s.chars().count()).unwrap_or(0))
                .sum();
            let avg_len = if rows.is_empty() {
                0.0
            } else {
                total_len as f64 / rows.len() as f64
            };
            ColumnProfile {
                string_typed,
                avg_len,
            }
        })
        .collect()
}

fn find_column(columns: &[String], names: &[&str]) -> Option<usize> {
    names.iter().find_map(|name| {
        columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(name))
    })
}

fn last_name_token(column: &str) -> Option<String> {
    column
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .last()
        .map(str::to_ascii_lowercase)
}

struct InferenceContext<'a> {
    columns: &'a [String],
    profiles: &'a [ColumnProfile],
    claimed: &'a [usize],
    config: &'a InferenceConfig,
}

type TextStrategy = fn(&InferenceContext<'_>) -> Option<TextSource>;

/// Tried in order; the first strategy that resolves a text source wins.
const TEXT_STRATEGIES: &[(&str, TextStrategy)] = &[
    ("exact_alias", exact_alias),
    ("longest_string", longest_string),
    ("suffix_alias", suffix_alias),
    ("ratings", rating_synthesis),
    ("concatenate", concatenate_strings),
];

fn exact_alias(ctx: &InferenceContext<'_>) -> Option<TextSource> {
    ctx.columns
        .iter()
        .position(|c| {
            let name = c.trim();
            TEXT_ALIASES.iter().any(|alias| name.eq_ignore_ascii_case(alias))
        })
        .map(TextSource::Column)
}

fn suffix_alias(ctx: &InferenceContext<'_>) -> Option<TextSource> {
    ctx.columns
        .iter()
        .enumerate()
        .find(|(idx, name)| {
            ctx.profiles[*idx].string_typed
                && !ctx.claimed.contains(idx)
                && last_name_token(name).is_some_and(|token| TEXT_ALIASES.contains(&token.as_str()))
        })
        .map(|(idx, _)| TextSource::Column(idx))
}

fn longest_string(ctx: &InferenceContext<'_>) -> Option<TextSource> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, profile) in ctx.profiles.iter().enumerate() {
        if !profile.string_typed || ctx.claimed.contains(&idx) {
            continue;
        }
        if profile.avg_len <= ctx.config.min_text_avg_len {
            continue;
        }
        if best.map_or(true, |(_, len)| profile.avg_len > len) {
            best = Some((idx, profile.avg_len));
        }
    }
    best.map(|(idx, _)| TextSource::Column(idx))
}

fn rating_synthesis(ctx: &InferenceContext<'_>) -> Option<TextSource> {
    let ratings = RatingColumns::locate(ctx.columns);
    ratings
        .is_present()
        .then(|| TextSource::SynthesizeFromRatings(ratings))
}

fn concatenate_strings(ctx: &InferenceContext<'_>) -> Option<TextSource> {
    let string_columns = ctx
        .profiles
        .iter()
        .enumerate()
        .filter(|(_, p)| p.string_typed)
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();
    (!string_columns.is_empty()).then_some(TextSource::ConcatenateStrings(string_columns))
}

/// Infers the ingestion plan from the column names and a sample of rows.
pub fn infer(
    columns: &[String],
    sample_rows: &[RawRow],
    config: &InferenceConfig,
) -> Result<Schema, NormalizeError> {
    if columns.len() == 1 && columns[0].trim().eq_ignore_ascii_case(COMPOSITE_COLUMN) {
        debug!("single composite feedback column detected");
        return Ok(Schema::Composite { column: 0 });
    }

    let id = find_column(columns, &[ID_COLUMN])
        .map(IdField::Column)
        .unwrap_or(IdField::Sequential);
    let source = find_column(columns, SOURCE_COLUMNS)
        .map(SourceField::Column)
        .unwrap_or(SourceField::Default);
    let timestamp = find_column(columns, TIMESTAMP_COLUMNS)
        .map(TimestampField::Column)
        .unwrap_or(TimestampField::Synthesized);

    let claimed = claimed_columns(id, source, timestamp);

    let profiles = profile_columns(columns, sample_rows);
    let ctx = InferenceContext {
        columns,
        profiles: &profiles,
        claimed: &claimed,
        config,
    };

    for (name, strategy) in TEXT_STRATEGIES {
        if let Some(text) = strategy(&ctx) {
            debug!(strategy = *name, ?text, ?source, ?timestamp, ?id, "resolved text source");
            return Ok(Schema::Tabular(TabularSchema {
                text,
                source,
                timestamp,
                id,
            }));
        }
    }

    Err(NormalizeError::NoTextSource {
        columns: columns.to_vec(),
    })
}

fn claimed_columns(id: IdField, source: SourceField, timestamp: TimestampField) -> Vec<usize> {
    let mut claimed = Vec::new();
    if let IdField::Column(idx) = id {
        claimed.push(idx);
    }
    if let SourceField::Column(idx) = source {
        claimed.push(idx);
    }
    if let TimestampField::Column(idx) = timestamp {
        claimed.push(idx);
    }
    claimed
}
