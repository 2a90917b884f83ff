//! Core domain model and run accounting for phishload.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const CRATE_NAME: &str = "phishload-core";

/// One decoded feed line, limited to the columns the loader understands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRow {
    pub phish_id: Option<String>,
    pub url: Option<String>,
    pub submission_time: Option<String>,
    pub verified: Option<String>,
}

/// Validated record ready to be written under its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRecord {
    pub phish_id: String,
    pub url: String,
    pub submission_time: Option<DateTime<Utc>>,
    pub verified: bool,
    pub ingested_at: DateTime<Utc>,
}

/// Replace-or-insert of a single document keyed by `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOperation {
    pub key: String,
    pub document: NormalizedRecord,
}

impl From<NormalizedRecord> for UpsertOperation {
    fn from(document: NormalizedRecord) -> Self {
        Self {
            key: document.phish_id.clone(),
            document,
        }
    }
}

/// A single operation the store refused while applying a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    /// Position of the operation inside the flushed batch.
    pub index: usize,
    pub key: String,
    pub message: String,
}

/// What the store confirmed for one bulk upsert call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkUpsertReport {
    pub inserted: u64,
    /// Existing documents that were matched and replaced, changed or not.
    pub matched: u64,
    pub failures: Vec<OperationFailure>,
}

impl BulkUpsertReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Per-invocation counters. Only ever grow during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub inserted: u64,
    pub updated: u64,
    pub invalid: u64,
    pub processed: u64,
    pub failed: u64,
    pub batches: u64,
}

impl RunCounters {
    pub fn record_accepted(&mut self) {
        self.processed += 1;
    }

    pub fn record_invalid(&mut self) {
        self.invalid += 1;
        self.processed += 1;
    }

    pub fn absorb(&mut self, report: &BulkUpsertReport) {
        self.batches += 1;
        self.inserted += report.inserted;
        self.updated += report.matched;
        self.failed += report.failures.len() as u64;
    }

    pub fn record_failed_batch(&mut self, size: usize) {
        self.batches += 1;
        self.failed += size as u64;
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Pipeline complete: {} inserted, {} updated, {} invalid skipped. Processed {} rows.",
            self.inserted, self.updated, self.invalid, self.processed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            phish_id: id.to_string(),
            url: format!("http://{id}.example"),
            submission_time: None,
            verified: false,
            ingested_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn upsert_operation_is_keyed_by_phish_id() {
        let op = UpsertOperation::from(record("8123"));
        assert_eq!(op.key, "8123");
        assert_eq!(op.document.phish_id, "8123");
    }

    #[test]
    fn counters_track_rows_and_batches() {
        let mut counters = RunCounters::default();
        counters.record_accepted();
        counters.record_accepted();
        counters.record_invalid();
        counters.absorb(&BulkUpsertReport {
            inserted: 1,
            matched: 0,
            failures: vec![OperationFailure {
                index: 1,
                key: "2".into(),
                message: "duplicate key".into(),
            }],
        });
        counters.record_failed_batch(3);

        assert_eq!(counters.processed, 3);
        assert_eq!(counters.invalid, 1);
        assert_eq!(counters.inserted, 1);
        assert_eq!(counters.updated, 0);
        assert_eq!(counters.failed, 4);
        assert_eq!(counters.batches, 2);
    }

    #[test]
    fn summary_line_reports_the_four_headline_counters() {
        let counters = RunCounters {
            inserted: 2,
            updated: 5,
            invalid: 1,
            processed: 8,
            failed: 0,
            batches: 1,
        };
        assert_eq!(
            counters.summary_line(),
            "Pipeline complete: 2 inserted, 5 updated, 1 invalid skipped. Processed 8 rows."
        );
    }

    #[test]
    fn normalized_record_serializes_missing_timestamp_as_null() {
        let value = serde_json::to_value(record("1")).unwrap();
        assert!(value["submission_time"].is_null());
        assert_eq!(value["verified"], serde_json::Value::Bool(false));
    }
}
