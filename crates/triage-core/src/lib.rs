//! Core data model for feedback triage: raw tables, canonical records, analysis results.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "triage-core";

/// Loosely-typed scalar cell as read from an export of unknown shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum RawValue {
    #[default]
    Null,
    Number(f64),
    Text(String),
}

static NULL_VALUE: RawValue = RawValue::Null;

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, RawValue::Text(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view of the cell; text cells are parsed leniently.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            RawValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            RawValue::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Some(*n as i64),
            RawValue::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// String rendering of the cell, `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Number(n) => Some(render_number(*n)),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One input row, stored positionally against its table's column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRow {
    values: Vec<RawValue>,
}

impl RawRow {
    pub fn get(&self, column: usize) -> &RawValue {
        self.values.get(column).unwrap_or(&NULL_VALUE)
    }

    pub fn values(&self) -> &[RawValue] {
        &self.values
    }
}

/// A batch of rows sharing one column set that is not known ahead of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawTable {
    columns: Vec<String>,
    rows: Vec<RawRow>,
}

impl RawTable {
    /// Builds a table, padding short rows with nulls and truncating long ones.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<RawValue>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut values| {
                values.resize(width, RawValue::Null);
                RawRow { values }
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive lookup of the first column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(name))
    }
}

/// Normalized feedback entry with guaranteed fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Some(Sentiment::Positive),
            "NEGATIVE" => Some(Sentiment::Negative),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "POSITIVE",
            Sentiment::Negative => "NEGATIVE",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    High,
    Low,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::High => "HIGH",
            Urgency::Low => "LOW",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the external sentiment scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentScore {
    pub label: Sentiment,
    pub confidence: f64,
}

/// Per-record classification; recomputed on every analysis, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sentiment: Sentiment,
    pub confidence: f64,
    pub urgency: Urgency,
}

/// A canonical record paired with its analysis, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriagedRecord {
    pub record: CanonicalRecord,
    pub analysis: AnalysisResult,
}
