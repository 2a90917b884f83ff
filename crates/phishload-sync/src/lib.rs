//! Fetch -> transform -> batched upsert orchestration for one ingestion run.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use phishload_adapters::{transform, FeedReader, RowDecodeError, Transformed};
use phishload_core::RunCounters;
use phishload_storage::{
    BackoffPolicy, FeedSource, FetchError, HttpClientConfig, HttpFeedFetcher, PgRecordStore,
    RecordStore, StoreError,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod loader;

pub use loader::{BatchLoader, DEFAULT_BATCH_SIZE};

pub const CRATE_NAME: &str = "phishload-sync";

pub const DEFAULT_TABLE: &str = "phishtank_raw";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub feed_url: String,
    pub table: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub backoff_step_secs: u64,
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            feed_url: required(&lookup, "PHISHTANK_URL")?,
            table: lookup("PHISHLOAD_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            user_agent: lookup("PHISHLOAD_USER_AGENT")
                .unwrap_or_else(|| format!("phishload/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parsed(&lookup, "FEED_TIMEOUT_SECS", 30)?,
            max_attempts: parsed(&lookup, "FEED_MAX_ATTEMPTS", 3)?,
            backoff_step_secs: parsed(&lookup, "FEED_BACKOFF_STEP_SECS", 5)?,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                step: Duration::from_secs(self.backoff_step_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after this many rows have been processed.
    pub limit: Option<u64>,
    pub batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RunOptions {
    fn limit_reached(&self, processed: u64) -> bool {
        self.limit.is_some_and(|limit| processed >= limit)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed header could not be read: {0}")]
    FeedHeader(#[source] RowDecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Fetching,
    Aborted,
    Streaming,
    Flushing,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Fetching => "fetching",
            RunPhase::Aborted => "aborted",
            RunPhase::Streaming => "streaming",
            RunPhase::Flushing => "flushing",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Aborted | RunPhase::Done)
    }

    fn advance(&mut self, next: RunPhase) {
        debug!(from = %self, to = %next, "run phase");
        *self = next;
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: RunCounters,
}

pub struct SyncPipeline<F, S> {
    feed: F,
    store: S,
}

impl<F: FeedSource, S: RecordStore> SyncPipeline<F, S> {
    pub fn new(feed: F, store: S) -> Self {
        Self { feed, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Connectivity probe plus unique key index; must succeed before a run.
    pub async fn prepare(&self) -> Result<(), StoreError> {
        self.store.ping().await?;
        self.store.ensure_key_index().await
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async {
            let started_at = Utc::now();
            let clock = Instant::now();
            let mut phase = RunPhase::Fetching;

            info!("downloading feed");
            let body = match self.feed.open().await {
                Ok(body) => body,
                Err(err) => {
                    phase.advance(RunPhase::Aborted);
                    error!(error = %err, "feed fetch failed; run aborted");
                    return Err(SyncError::Fetch(err));
                }
            };
            let mut reader = match FeedReader::new(body).await {
                Ok(reader) => reader,
                Err(err) => {
                    phase.advance(RunPhase::Aborted);
                    error!(error = %err, "feed header unreadable; run aborted");
                    return Err(SyncError::FeedHeader(err));
                }
            };

            phase.advance(RunPhase::Streaming);
            let mut loader = BatchLoader::new(&self.store, options.batch_size);
            while !options.limit_reached(loader.counters().processed) {
                let Some(next) = reader.next_row().await else {
                    break;
                };
                match next {
                    Ok(row) => match transform(&row) {
                        Transformed::Accepted(record) => loader.push(record).await,
                        Transformed::Discarded(reason) => {
                            debug!(%reason, ?row, "row discarded");
                            loader.record_invalid();
                        }
                    },
                    Err(RowDecodeError::Stream(err)) => {
                        error!(error = %err, "feed stream broke; keeping rows read so far");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "row could not be decoded");
                        loader.record_invalid();
                    }
                }
            }

            phase.advance(RunPhase::Flushing);
            let counters = loader.finish().await;
            phase.advance(RunPhase::Done);

            info!(
                inserted = counters.inserted,
                updated = counters.updated,
                invalid = counters.invalid,
                processed = counters.processed,
                failed = counters.failed,
                batches = counters.batches,
                elapsed_ms = clock.elapsed().as_millis() as u64,
                "sync run complete"
            );

            Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                counters,
            })
        }
        .instrument(span)
        .await
    }
}

/// Connect the store, probe it and ensure the key index. Any failure here is
/// fatal for the process.
pub async fn connect_from_config(
    config: &SyncConfig,
) -> anyhow::Result<SyncPipeline<HttpFeedFetcher, PgRecordStore>> {
    let store = PgRecordStore::connect(&config.database_url, &config.table)
        .await
        .context("connecting to the record store")?;
    let fetcher = HttpFeedFetcher::new(config.feed_url.clone(), config.http_client_config())?;
    let pipeline = SyncPipeline::new(fetcher, store);
    pipeline
        .prepare()
        .await
        .context("preparing the record store")?;
    info!(table = %config.table, "connected to record store");
    Ok(pipeline)
}
