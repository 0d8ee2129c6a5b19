//! Table loading, schema inference and record normalization for feedback exports.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use triage_core::{RawTable, RawValue};

use crate::schema::COMPOSITE_COLUMN;

pub mod composite;
pub mod normalize;
pub mod schema;
pub mod summary;

pub use composite::{parse_composite, CompositeDefaults, CompositeFields};
pub use normalize::{normalize, RecordNormalizer};
pub use schema::{infer, InferenceConfig, RatingColumns, Schema, TabularSchema, TextSource};
pub use summary::{summarize, DataSummary, DateRange, SourceCount};

pub const CRATE_NAME: &str = "triage-adapters";

/// Batch-level normalization failures. Each one aborts the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("input table has no rows")]
    EmptyInput,
    #[error("no usable text column or synthesis strategy among columns [{}]", .columns.join(", "))]
    NoTextSource { columns: Vec<String> },
    #[error("all {input_rows} rows were dropped for empty text")]
    EmptyResult { input_rows: usize },
}

const NULL_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL"];

/// Interprets one delimited-text cell as a loosely-typed scalar.
pub fn parse_cell(raw: &str) -> RawValue {
    let trimmed = raw.trim();
    if NULL_TOKENS.contains(&trimmed) {
        return RawValue::Null;
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => RawValue::Number(n),
        _ => RawValue::Text(raw.to_string()),
    }
}

/// Loads a table from disk, choosing the reader by file extension.
pub fn load_table(path: impl AsRef<Path>) -> Result<RawTable> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let table = if is_json {
        parse_json_table(&text)
    } else {
        parse_csv_table(&text)
    }
    .with_context(|| format!("parsing {}", path.display()))?;
    debug!(
        path = %path.display(),
        rows = table.len(),
        columns = ?table.columns(),
        "loaded table"
    );
    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsvReadStrategy {
    /// Lone `feedback` header: every following line is that column's raw value.
    CompositeLines,
    Standard,
    /// Quote characters are ordinary data; ragged rows are padded or truncated.
    Unquoted,
}

impl CsvReadStrategy {
    fn applies_to(self, header: &str) -> bool {
        match self {
            CsvReadStrategy::CompositeLines => is_composite_header(header),
            CsvReadStrategy::Standard | CsvReadStrategy::Unquoted => true,
        }
    }
}

fn is_composite_header(header: &str) -> bool {
    header
        .trim()
        .trim_matches('"')
        .trim()
        .eq_ignore_ascii_case(COMPOSITE_COLUMN)
}

const CSV_READ_STRATEGIES: [CsvReadStrategy; 3] = [
    CsvReadStrategy::CompositeLines,
    CsvReadStrategy::Standard,
    CsvReadStrategy::Unquoted,
];

/// Parses CSV text, trying each read strategy in order and keeping the first that succeeds.
pub fn parse_csv_table(text: &str) -> Result<RawTable> {
    let text = text.trim_start_matches('\u{feff}');
    let header = text.lines().next().unwrap_or_default();
    let mut failures = Vec::new();
    for strategy in CSV_READ_STRATEGIES {
        if !strategy.applies_to(header) {
            continue;
        }
        match read_csv_with(text, strategy) {
            Ok(table) => {
                if !failures.is_empty() {
                    warn!(?strategy, "csv read fell back after earlier strategies failed");
                }
                return Ok(table);
            }
            Err(err) => {
                debug!(?strategy, error = %err, "csv read strategy not applicable");
                failures.push(format!("{strategy:?}: {err}"));
            }
        }
    }
    bail!("no csv read strategy succeeded ({})", failures.join("; "))
}

fn read_csv_with(text: &str, strategy: CsvReadStrategy) -> Result<RawTable> {
    match strategy {
        CsvReadStrategy::CompositeLines => read_composite_lines(text),
        CsvReadStrategy::Standard => read_csv_records(
            csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(false)
                .from_reader(text.as_bytes()),
        ),
        CsvReadStrategy::Unquoted => read_csv_records(
            csv::ReaderBuilder::new()
                .has_headers(true)
                .quoting(false)
                .flexible(true)
                .from_reader(text.as_bytes()),
        ),
    }
}

fn read_composite_lines(text: &str) -> Result<RawTable> {
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
    let Some(header) = lines.next() else {
        bail!("empty input");
    };
    if !is_composite_header(header) {
        bail!("header is not a lone {COMPOSITE_COLUMN} column");
    }
    let column = header.trim().trim_matches('"').trim().to_string();
    let rows = lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| vec![parse_cell(line)])
        .collect();
    Ok(RawTable::new(vec![column], rows))
}

fn read_csv_records(mut reader: csv::Reader<&[u8]>) -> Result<RawTable> {
    let columns = reader
        .headers()
        .context("reading csv header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        bail!("csv has no header row");
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("reading csv record")?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(parse_cell).collect());
    }
    Ok(RawTable::new(columns, rows))
}

/// Parses a JSON array of flat objects; columns follow first-seen key order.
pub fn parse_json_table(text: &str) -> Result<RawTable> {
    let value: JsonValue = serde_json::from_str(text).context("invalid JSON table")?;
    let Some(items) = value.as_array() else {
        bail!("expected a JSON array of objects");
    };

    let mut columns: Vec<String> = Vec::new();
    for item in items {
        let Some(object) = item.as_object() else {
            bail!("expected every JSON row to be an object");
        };
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let rows = items
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|object| {
            columns
                .iter()
                .map(|column| object.get(column).map(json_cell).unwrap_or_default())
                .collect()
        })
        .collect();
    Ok(RawTable::new(columns, rows))
}

fn json_cell(value: &JsonValue) -> RawValue {
    match value {
        JsonValue::Null => RawValue::Null,
        JsonValue::Number(n) => n.as_f64().map(RawValue::Number).unwrap_or_default(),
        JsonValue::String(s) => RawValue::Text(s.clone()),
        JsonValue::Bool(b) => RawValue::Text(b.to_string()),
        other => RawValue::Text(other.to_string()),
    }
}
