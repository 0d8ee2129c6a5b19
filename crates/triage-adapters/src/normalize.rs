//! Record normalization: applies an inferred schema to every row of a batch.

use tracing::{debug, info};
use triage_core::{CanonicalRecord, RawRow, RawTable, RawValue};

use crate::composite::parse_composite;
use crate::schema::{
    infer, IdField, InferenceConfig, RatingColumns, Schema, SourceField, TabularSchema,
    TextSource, TimestampField,
};
use crate::NormalizeError;

/// Row-level fields before the empty-text filter and id assignment.
#[derive(Debug, Clone)]
struct RecordDraft {
    id: Option<i64>,
    text: String,
    source: String,
    timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    config: InferenceConfig,
}

impl RecordNormalizer {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Converts a raw batch into canonical records, in input order.
    pub fn normalize(&self, table: &RawTable) -> Result<Vec<CanonicalRecord>, NormalizeError> {
        if table.is_empty() {
            return Err(NormalizeError::EmptyInput);
        }

        let schema = infer(table.columns(), table.rows(), &self.config)?;
        let drafts: Vec<RecordDraft> = match &schema {
            Schema::Composite { column } => {
                info!(rows = table.len(), "parsing single composite feedback column");
                table
                    .rows()
                    .iter()
                    .map(|row| self.composite_draft(row, *column))
                    .collect()
            }
            Schema::Tabular(plan) => table
                .rows()
                .iter()
                .enumerate()
                .map(|(row_index, row)| self.tabular_draft(plan, row_index, row))
                .collect(),
        };

        let kept: Vec<RecordDraft> = drafts
            .into_iter()
            .filter(|draft| !draft.text.trim().is_empty())
            .collect();
        let records = assign_ids(kept);

        debug!(
            input_rows = table.len(),
            kept = records.len(),
            dropped = table.len() - records.len(),
            "normalized batch"
        );
        if records.is_empty() {
            return Err(NormalizeError::EmptyResult {
                input_rows: table.len(),
            });
        }
        Ok(records)
    }

    fn composite_draft(&self, row: &RawRow, column: usize) -> RecordDraft {
        let raw = row.get(column).render().unwrap_or_default();
        let fields = parse_composite(&raw, &self.config.composite);
        RecordDraft {
            id: None,
            text: fields.text,
            source: fields.source,
            timestamp: fields.timestamp,
        }
    }

    fn tabular_draft(&self, plan: &TabularSchema, row_index: usize, row: &RawRow) -> RecordDraft {
        let text = match &plan.text {
            TextSource::Column(idx) => row.get(*idx).render().unwrap_or_default(),
            TextSource::SynthesizeFromRatings(ratings) => self.text_from_ratings(ratings, row),
            TextSource::ConcatenateStrings(columns) => columns
                .iter()
                .filter_map(|idx| row.get(*idx).render())
                .collect::<Vec<_>>()
                .join(&self.config.concat_separator),
        };

        let source = match plan.source {
            SourceField::Column(idx) => row.get(idx).render(),
            SourceField::Default => None,
        }
        .unwrap_or_else(|| self.config.default_source.clone());

        let timestamp = match plan.timestamp {
            TimestampField::Column(idx) => row.get(idx).render(),
            TimestampField::Synthesized => None,
        }
        .unwrap_or_else(|| self.config.synthesized_timestamp(row_index));

        let id = match plan.id {
            IdField::Column(idx) => row.get(idx).as_i64(),
            IdField::Sequential => None,
        };

        RecordDraft {
            id,
            text,
            source,
            timestamp,
        }
    }

    fn text_from_ratings(&self, ratings: &RatingColumns, row: &RawRow) -> String {
        let mut clauses: Vec<String> = Vec::new();

        if let Some(overall) = ratings.overall.and_then(|idx| row.get(idx).as_f64()) {
            let bucket = match overall.trunc() as i64 {
                r if r >= 4 => "Great experience",
                3 => "Average experience",
                _ => "Poor experience",
            };
            clauses.push(bucket.to_string());
        }

        if let Some(review_type) = ratings
            .review_type
            .and_then(|idx| row.get(idx).render())
            .filter(|s| !s.trim().is_empty() && s.trim() != "NA")
        {
            clauses.push(format!("visited {review_type}"));
        }

        let aspects = ratings
            .aspects
            .iter()
            .filter_map(|(idx, label)| aspect_clause(row.get(*idx), label))
            .collect::<Vec<_>>();
        if !aspects.is_empty() {
            clauses.push(aspects.join(", "));
        }

        if clauses.is_empty() {
            self.config.ratings_only_text.clone()
        } else {
            format!("{}.", clauses.join(". "))
        }
    }
}

/// Without any supplied id, records are numbered by position after filtering.
/// Otherwise rows lacking a usable id continue after the largest supplied one,
/// so a fallback never repeats a real id.
fn assign_ids(drafts: Vec<RecordDraft>) -> Vec<CanonicalRecord> {
    let largest_supplied = drafts.iter().filter_map(|d| d.id).max();
    let mut next_fallback = largest_supplied.unwrap_or(0);
    drafts
        .into_iter()
        .map(|draft| {
            let id = match draft.id {
                Some(id) => id,
                None => {
                    next_fallback = next_fallback.saturating_add(1);
                    next_fallback
                }
            };
            CanonicalRecord {
                id,
                text: draft.text,
                source: draft.source,
                timestamp: draft.timestamp,
            }
        })
        .collect()
}

fn aspect_clause(value: &RawValue, label: &str) -> Option<String> {
    let rating = value.as_f64()?;
    if rating >= 4.0 {
        Some(format!("excellent {label}"))
    } else if rating <= 2.0 {
        Some(format!("poor {label}"))
    } else {
        None
    }
}

/// Normalizes a table with the default inference configuration.
pub fn normalize(table: &RawTable) -> Result<Vec<CanonicalRecord>, NormalizeError> {
    RecordNormalizer::default().normalize(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    fn num(n: f64) -> RawValue {
        RawValue::Number(n)
    }

    fn table(columns: &[&str], rows: Vec<Vec<RawValue>>) -> RawTable {
        RawTable::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn compound_text_column_with_store_source() {
        let t = table(
            &["id", "review_text", "store"],
            vec![vec![num(1.0), text("Great service!"), text("NYC")]],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(
            records,
            vec![CanonicalRecord {
                id: 1,
                text: "Great service!".into(),
                source: "NYC".into(),
                timestamp: "2025-10-01 00:00:00".into(),
            }]
        );
    }

    #[test]
    fn composite_column_is_parsed_per_row() {
        let t = table(
            &["feedback"],
            vec![
                vec![text(r#"""I hate this"",NEGATIVE,Twitter,2025-10-01,user1,NYC,0.9"#)],
                vec![text(r#"""Love it"",POSITIVE,Email,2025-10-02,user2,SF,0.8"#)],
            ],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].text, "I hate this");
        assert_eq!(records[0].source, "Twitter");
        assert_eq!(records[0].timestamp, "2025-10-01");
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].source, "Email");
    }

    #[test]
    fn ratings_only_rows_get_synthesized_sentences() {
        let t = table(
            &["Review_Overall_Rating", "Rating_Service"],
            vec![vec![num(5.0), num(5.0)]],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(records[0].text, "Great experience. excellent service.");
        assert_eq!(records[0].source, "CSV Data");
    }

    #[test]
    fn rating_sentences_cover_buckets_review_type_and_aspects() {
        let t = table(
            &[
                "Hotel_Name_City",
                "Review_Overall_Rating",
                "Review_Type",
                "Rating_Rooms",
                "Rating_Cleanliness",
                "Rating_Service",
            ],
            vec![
                vec![text("Inn, Rome"), num(2.0), text("Couples"), num(1.0), num(2.0), num(3.0)],
                vec![text("Inn, Rome"), num(3.9), text("NA"), num(3.0), RawValue::Null, num(4.5)],
                vec![text("Inn, Rome"), RawValue::Null, RawValue::Null, RawValue::Null, num(3.0), RawValue::Null],
            ],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(
            records[0].text,
            "Poor experience. visited Couples. poor rooms, poor cleanliness."
        );
        assert_eq!(records[1].text, "Average experience. excellent service.");
        assert_eq!(records[2].text, "Customer review with ratings only");
        assert_eq!(records[0].source, "Inn, Rome");
    }

    #[test]
    fn concatenation_joins_string_columns_in_order() {
        let t = table(
            &["name", "city", "stars"],
            vec![
                vec![text("Ann"), text("Oslo"), num(3.0)],
                vec![text("Bo"), RawValue::Null, num(4.0)],
            ],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(records[0].text, "Ann | Oslo");
        assert_eq!(records[1].text, "Bo");
    }

    #[test]
    fn empty_text_rows_are_dropped_and_ids_stay_contiguous() {
        let t = table(
            &["text", "source"],
            vec![
                vec![text("first"), text("web")],
                vec![text("   "), text("web")],
                vec![RawValue::Null, text("web")],
                vec![text("fourth"), RawValue::Null],
            ],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(records[1].text, "fourth");
        assert_eq!(records[1].source, "CSV Data");
        assert_eq!(records[1].timestamp, "2025-10-01 03:00:00");
    }

    #[test]
    fn supplied_ids_pass_through_with_gaps() {
        let t = table(
            &["id", "comment", "date"],
            vec![
                vec![num(10.0), text("a"), text("2025-01-01")],
                vec![num(11.0), text(""), text("2025-01-02")],
                vec![num(12.0), text("c"), RawValue::Null],
            ],
        );
        let records = normalize(&t).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![10, 12]);
        assert_eq!(records[0].timestamp, "2025-01-01");
        assert_eq!(records[1].timestamp, "2025-10-01 02:00:00");
    }

    #[test]
    fn unusable_ids_continue_after_the_largest_supplied_one() {
        let t = table(
            &["id", "comment"],
            vec![
                vec![num(2.0), text("first")],
                vec![text("x"), text("second")],
            ],
        );
        let ids = normalize(&t).unwrap().iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3]);

        let t = table(
            &["id", "comment"],
            vec![
                vec![RawValue::Null, text("first")],
                vec![num(5.0), text("second")],
                vec![text("n/a"), text("third")],
            ],
        );
        let ids = normalize(&t).unwrap().iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![6, 5, 7]);
    }

    #[test]
    fn distinguishes_empty_input_from_empty_result() {
        let empty = table(&["text"], vec![]);
        assert_eq!(normalize(&empty), Err(NormalizeError::EmptyInput));

        let blank = table(&["text"], vec![vec![text(" ")], vec![text("")]]);
        assert_eq!(
            normalize(&blank),
            Err(NormalizeError::EmptyResult { input_rows: 2 })
        );

        let numeric = table(&["a"], vec![vec![num(1.0)]]);
        assert!(matches!(
            normalize(&numeric),
            Err(NormalizeError::NoTextSource { .. })
        ));
    }

    fn arb_cell() -> impl Strategy<Value = RawValue> {
        prop_oneof![
            Just(RawValue::Null),
            (0.0f64..10.0).prop_map(RawValue::Number),
            "[ a-zA-Z\",]{0,40}".prop_map(RawValue::Text),
        ]
    }

    fn arb_table() -> impl Strategy<Value = RawTable> {
        let names = prop::sample::select(vec![
            "text", "id", "source", "notes", "store", "rating", "Rating_Service", "feedback", "date",
        ]);
        prop::collection::vec(names, 1..4).prop_flat_map(|mut columns| {
            columns.dedup();
            let width = columns.len();
            prop::collection::vec(prop::collection::vec(arb_cell(), width), 0..12).prop_map(
                move |rows| RawTable::new(columns.iter().map(|c| c.to_string()).collect(), rows),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_normalization_is_deterministic(t in arb_table()) {
            prop_assert_eq!(normalize(&t), normalize(&t));
        }

        #[test]
        fn prop_text_is_never_blank(t in arb_table()) {
            if let Ok(records) = normalize(&t) {
                for record in &records {
                    prop_assert!(!record.text.trim().is_empty());
                }
            }
        }

        #[test]
        fn prop_synthesized_ids_are_contiguous(t in arb_table()) {
            if t.column_index("id").is_none() {
                if let Ok(records) = normalize(&t) {
                    let ids = records.iter().map(|r| r.id).collect::<Vec<_>>();
                    let expected = (1..=records.len() as i64).collect::<Vec<_>>();
                    prop_assert_eq!(ids, expected);
                }
            }
        }
    }
}
