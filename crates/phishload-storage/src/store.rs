use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use phishload_core::{BulkUpsertReport, NormalizedRecord, OperationFailure, UpsertOperation};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Keyed document collection the loader writes into.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Connectivity probe, run once before any fetch.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Make sure the natural key is backed by a unique index.
    async fn ensure_key_index(&self) -> Result<(), StoreError>;

    /// Apply the operations unordered. Per-operation rejections come back in
    /// the report; `Err` means nothing can be said about the batch.
    async fn bulk_upsert(&self, ops: &[UpsertOperation]) -> Result<BulkUpsertReport, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && table.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            phish_id        TEXT        NOT NULL,
            url             TEXT        NOT NULL,
            submission_time TIMESTAMPTZ NULL,
            verified        BOOLEAN     NOT NULL DEFAULT FALSE,
            ingested_at     TIMESTAMPTZ NOT NULL
        )
        "#
    )
}

fn create_key_index_sql(table: &str) -> String {
    format!("CREATE UNIQUE INDEX IF NOT EXISTS {table}_phish_id_key ON {table} (phish_id)")
}

// xmax is zero only for a freshly inserted row version.
fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (phish_id, url, submission_time, verified, ingested_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (phish_id) DO UPDATE
           SET url = EXCLUDED.url,
               submission_time = EXCLUDED.submission_time,
               verified = EXCLUDED.verified,
               ingested_at = EXCLUDED.ingested_at
        RETURNING (xmax = 0) AS inserted
        "#
    )
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn ensure_key_index(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_key_index_sql(&self.table))
            .execute(&self.pool)
            .await?;
        info!(table = %self.table, "unique index on phish_id ensured");
        Ok(())
    }

    async fn bulk_upsert(&self, ops: &[UpsertOperation]) -> Result<BulkUpsertReport, StoreError> {
        let sql = upsert_sql(&self.table);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let mut report = BulkUpsertReport::default();
        for (index, op) in ops.iter().enumerate() {
            let result = sqlx::query(&sql)
                .bind(&op.key)
                .bind(&op.document.url)
                .bind(op.document.submission_time)
                .bind(op.document.verified)
                .bind(op.document.ingested_at)
                .fetch_one(&mut *conn)
                .await
                .and_then(|row| row.try_get::<bool, _>("inserted"));

            match result {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.matched += 1,
                Err(err) => report.failures.push(OperationFailure {
                    index,
                    key: op.key.clone(),
                    message: err.to_string(),
                }),
            }
        }
        debug!(
            table = %self.table,
            inserted = report.inserted,
            matched = report.matched,
            failed = report.failures.len(),
            "bulk upsert applied"
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, NormalizedRecord>,
    rejected_keys: HashSet<String>,
    outages: usize,
    unreachable: bool,
    indexed: bool,
    batch_sizes: Vec<usize>,
}

/// In-process store with fault injection, for exercising the loader.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every upsert of `key` will be reported as a failed operation.
    pub fn with_rejected_key(self, key: impl Into<String>) -> Self {
        self.state().rejected_keys.insert(key.into());
        self
    }

    /// The next `count` bulk calls fail as a whole.
    pub fn with_outages(self, count: usize) -> Self {
        self.state().outages = count;
        self
    }

    pub fn unreachable() -> Self {
        let store = Self::default();
        store.state().unreachable = true;
        store
    }

    pub fn documents(&self) -> BTreeMap<String, NormalizedRecord> {
        self.state().documents.clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batch_sizes.clone()
    }

    pub fn is_indexed(&self) -> bool {
        self.state().indexed
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.state().unreachable {
            return Err(StoreError::Unavailable("memory store marked unreachable".into()));
        }
        Ok(())
    }

    async fn ensure_key_index(&self) -> Result<(), StoreError> {
        self.state().indexed = true;
        Ok(())
    }

    async fn bulk_upsert(&self, ops: &[UpsertOperation]) -> Result<BulkUpsertReport, StoreError> {
        let mut state = self.state();
        state.batch_sizes.push(ops.len());
        if state.outages > 0 {
            state.outages -= 1;
            return Err(StoreError::Unavailable("injected outage".into()));
        }

        let mut report = BulkUpsertReport::default();
        for (index, op) in ops.iter().enumerate() {
            if state.rejected_keys.contains(&op.key) {
                report.failures.push(OperationFailure {
                    index,
                    key: op.key.clone(),
                    message: "duplicate key value violates unique constraint".into(),
                });
                continue;
            }
            match state.documents.insert(op.key.clone(), op.document.clone()) {
                Some(_) => report.matched += 1,
                None => report.inserted += 1,
            }
        }
        Ok(report)
    }
}
