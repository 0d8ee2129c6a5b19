use std::fs;
use std::path::{Path, PathBuf};

use triage_adapters::{load_table, normalize, summarize, DateRange};
use triage_core::CanonicalRecord;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_dir(name: &str) -> PathBuf {
    workspace_root().join("fixtures").join(name)
}

fn read_snapshot(path: &Path) -> Vec<CanonicalRecord> {
    let text = fs::read_to_string(path).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn assert_matches_snapshot(name: &str, export: &str) -> Vec<CanonicalRecord> {
    let dir = fixture_dir(name);
    let table = load_table(dir.join(export)).expect("load fixture export");
    let records = normalize(&table).expect("normalize fixture");
    let expected = read_snapshot(&dir.join("snapshot.json"));
    assert_eq!(records, expected, "snapshot mismatch for {name}");
    records
}

#[test]
fn golden_snapshot_composite_export() {
    let records = assert_matches_snapshot("composite-export", "export.csv");
    let summary = summarize(&records);
    assert_eq!(summary.total_feedback, 4);
    assert_eq!(summary.unique_sources, 4);
    assert_eq!(
        summary.date_range,
        Some(DateRange::Range {
            start: "2025-10-01 00:00:00".into(),
            end: "2025-10-01 16:10:00".into(),
        })
    );
}

#[test]
fn golden_snapshot_hotel_ratings() {
    let records = assert_matches_snapshot("hotel-ratings", "export.csv");
    let summary = summarize(&records);
    assert_eq!(summary.source_counts[0].source, "Harbor Inn, Boston");
    assert_eq!(summary.source_counts[0].count, 2);
}

#[test]
fn golden_snapshot_store_reviews() {
    let records = assert_matches_snapshot("store-reviews", "export.json");
    assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![101, 103]);
}
