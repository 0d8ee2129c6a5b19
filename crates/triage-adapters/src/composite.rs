//! Best-effort parsing of single-column exports that pack a whole record into one string.
//!
//! A composite value looks like `""text, maybe with commas"",LABEL,Source,2025-10-01,...`.
//! Parsing never fails: anything that cannot be located falls back to a default.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static DOUBLE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"""(.*?)"""#).expect("valid double-quoted pattern"));
static SINGLE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(.*?)""#).expect("valid quoted pattern"));

const SOURCE_SEGMENT: usize = 2;
const TIMESTAMP_SEGMENT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeDefaults {
    pub source: String,
    pub timestamp: String,
    /// Characters kept as text when no quoted span exists.
    pub fallback_text_chars: usize,
}

impl Default for CompositeDefaults {
    fn default() -> Self {
        Self {
            source: "Unknown".to_string(),
            timestamp: "2025-10-01".to_string(),
            fallback_text_chars: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeFields {
    pub text: String,
    pub source: String,
    pub timestamp: String,
}

/// Extracts text, source and timestamp from one composite value.
pub fn parse_composite(raw: &str, defaults: &CompositeDefaults) -> CompositeFields {
    let stripped = strip_one_quote_layer(raw);

    let text = DOUBLE_QUOTED
        .captures(stripped)
        .or_else(|| SINGLE_QUOTED.captures(stripped))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches('"').to_string())
        .unwrap_or_else(|| stripped.chars().take(defaults.fallback_text_chars).collect());

    let segments = split_unquoted_commas(stripped);
    let source = segment_or(&segments, SOURCE_SEGMENT, &defaults.source);
    let timestamp = segment_or(&segments, TIMESTAMP_SEGMENT, &defaults.timestamp);

    CompositeFields {
        text,
        source,
        timestamp,
    }
}

fn strip_one_quote_layer(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    trimmed.strip_suffix('"').unwrap_or(trimmed)
}

/// Splits on commas that sit outside quoted spans. A comma splits only when an even
/// number of quote runs precede it; adjacent quotes (`""`) form a single run.
fn split_unquoted_commas(input: &str) -> Vec<&str> {
    let mut quote_runs = 0usize;
    let mut previous_was_quote = false;
    let mut segments = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => {
                if !previous_was_quote {
                    quote_runs += 1;
                }
                previous_was_quote = true;
                continue;
            }
            ',' if quote_runs % 2 == 0 => {
                segments.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
        previous_was_quote = false;
    }
    segments.push(&input[start..]);
    segments
}

fn segment_or(segments: &[&str], index: usize, default: &str) -> String {
    segments
        .get(index)
        .map(|s| s.trim().trim_matches('"'))
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> CompositeFields {
        parse_composite(raw, &CompositeDefaults::default())
    }

    #[test]
    fn unbalanced_export_line_yields_text_source_and_date() {
        let fields = parse(r#"""I hate this"",NEGATIVE,Twitter,2025-10-01,user1,NYC,0.9"#);
        assert_eq!(
            fields,
            CompositeFields {
                text: "I hate this".into(),
                source: "Twitter".into(),
                timestamp: "2025-10-01".into(),
            }
        );
    }

    #[test]
    fn fully_quoted_line_prefers_double_double_quotes() {
        let fields = parse(
            r#""""Slow, buggy, and it crashed"",NEGATIVE,App Review,2025-10-02 09:15:00,u2,LA,0.97""#,
        );
        assert_eq!(fields.text, "Slow, buggy, and it crashed");
        assert_eq!(fields.source, "App Review");
        assert_eq!(fields.timestamp, "2025-10-02 09:15:00");
    }

    #[test]
    fn commas_inside_quotes_do_not_split() {
        let segments = split_unquoted_commas(r#""a,b",c,"d,e",f"#);
        assert_eq!(segments, vec![r#""a,b""#, "c", r#""d,e""#, "f"]);

        let segments = split_unquoted_commas(r#"""a, b"",c"#);
        assert_eq!(segments, vec![r#"""a, b"""#, "c"]);
    }

    #[test]
    fn missing_segments_fall_back_to_defaults() {
        let fields = parse(r#"""Only text here"",POSITIVE"#);
        assert_eq!(fields.text, "Only text here");
        assert_eq!(fields.source, "Unknown");
        assert_eq!(fields.timestamp, "2025-10-01");

        let fields = parse(r#"""x"",NEGATIVE, ,"#);
        assert_eq!(fields.source, "Unknown");
        assert_eq!(fields.timestamp, "2025-10-01");
    }

    #[test]
    fn unquoted_input_keeps_a_bounded_prefix_as_text() {
        let raw = "no quotes at all in this export line, just a long run of words, Email, 2025-10-03";
        let fields = parse(raw);
        assert_eq!(fields.text, raw.chars().take(50).collect::<String>());
        assert_eq!(fields.source, "Email");
        assert_eq!(fields.timestamp, "2025-10-03");
    }

    #[test]
    fn degenerate_inputs_never_panic() {
        for raw in ["", "\"", "\"\"", ",,,", "é\"ü,ß", "\"\"\"\""] {
            let fields = parse(raw);
            assert!(fields.text.chars().count() <= 50);
        }
    }
}
