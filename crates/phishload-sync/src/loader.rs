use phishload_core::{NormalizedRecord, RunCounters, UpsertOperation};
use phishload_storage::RecordStore;
use tracing::{debug, error, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Buffers accepted records and flushes them to the store in fixed-size
/// batches, folding every store answer into the run counters.
pub struct BatchLoader<'s, S: RecordStore + ?Sized> {
    store: &'s S,
    batch_size: usize,
    pending: Vec<UpsertOperation>,
    counters: RunCounters,
}

impl<'s, S: RecordStore + ?Sized> BatchLoader<'s, S> {
    pub fn new(store: &'s S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            counters: RunCounters::default(),
        }
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn record_invalid(&mut self) {
        self.counters.record_invalid();
    }

    pub async fn push(&mut self, record: NormalizedRecord) {
        self.counters.record_accepted();
        self.pending.push(UpsertOperation::from(record));
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Send the pending batch. Store failures are logged, never returned.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        debug!(size = batch.len(), "flushing batch");

        match self.store.bulk_upsert(&batch).await {
            Ok(report) => {
                if report.is_partial() {
                    for failure in &report.failures {
                        warn!(
                            index = failure.index,
                            key = %failure.key,
                            message = %failure.message,
                            "upsert rejected"
                        );
                    }
                    warn!(
                        size = batch.len(),
                        failed = report.failures.len(),
                        "bulk write partially failed"
                    );
                }
                self.counters.absorb(&report);
            }
            Err(err) => {
                error!(size = batch.len(), error = %err, "bulk write failed; batch dropped");
                self.counters.record_failed_batch(batch.len());
            }
        }
    }

    pub async fn finish(mut self) -> RunCounters {
        self.flush().await;
        self.counters
    }
}
