//! Batched, idempotent loading of trade records
//!
//! Records are upserted on their natural key `(period, commodity, flow,
//! partner)` in bounded batches, each committed atomically. A batch that fails
//! is retried once; a second failure marks the release `Failed` with the rows
//! committed so far. After every commit the ledger records how many parsed
//! records are durable, so a restarted load skips that prefix.
//!
//! Within one release, a later record with the same key replaces an earlier
//! one (last write wins), including inside a single batch.

pub mod postgres;

pub use postgres::PgRecordStore;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tradedata_common::{Period, TradeFlow};

use crate::error::{IngestError, Result};
use crate::ledger::IngestionLedger;
use crate::models::{IngestionState, IngestionStatus, LoadResult, NaturalKey, ReleaseId, SkippedRecords, TradeRecord};

/// Default number of records per committed batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Upper bound keeping one batch within the bind-parameter limit of a statement
pub const MAX_BATCH_SIZE: usize = 5000;

/// Row count for one period and flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodCount {
    pub period: Period,
    pub flow: TradeFlow,
    pub rows: u64,
}

/// Destination table for trade records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert `records` atomically, tagging each row with `release_id`.
    ///
    /// Keys must be unique within the batch. Returns the number of rows that
    /// were inserted or whose values changed.
    async fn upsert_batch(&self, release_id: &ReleaseId, records: &[TradeRecord]) -> Result<u64>;

    /// Delete every row last written by `release_id`
    async fn delete_release_rows(&self, release_id: &ReleaseId) -> Result<u64>;

    /// Stored rows per period and flow, optionally bounded (inclusive)
    async fn count_by_period(&self, from: Option<Period>, to: Option<Period>) -> Result<Vec<PeriodCount>>;
}

/// Streams parsed records into a [`RecordStore`], keeping the ledger current
pub struct Loader {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn IngestionLedger>,
    batch_size: usize,
}

impl Loader {
    pub fn new(store: Arc<dyn RecordStore>, ledger: Arc<dyn IngestionLedger>, batch_size: usize) -> Self {
        Self {
            store,
            ledger,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load every record of `records` for `release_id`.
    ///
    /// A release already at `Loading` resumes after its committed prefix.
    /// Cancellation is checked between records; the ledger is left at its
    /// last committed progress and [`IngestError::Cancelled`] is returned.
    pub async fn load<S>(
        &self,
        release_id: &ReleaseId,
        mut records: S,
        skipped: &SkippedRecords,
        cancel: &CancellationToken,
    ) -> Result<LoadResult>
    where
        S: Stream<Item = Result<TradeRecord>> + Unpin + Send,
    {
        let state = self
            .ledger
            .get(release_id)
            .await?
            .ok_or_else(|| IngestError::UnknownRelease(release_id.to_string()))?;

        let resume_from = if state.status == IngestionStatus::Loading {
            state.rows_loaded
        } else {
            0
        };
        let mut state = state.advance(IngestionStatus::Loading).with_rows(resume_from);
        self.ledger.upsert_state(&state).await?;

        if resume_from > 0 {
            info!(release = %release_id, resume_from, "Resuming load after committed records");
        }

        let mut result = LoadResult {
            rows_loaded: resume_from,
            ..LoadResult::default()
        };
        let mut seen: u64 = 0;
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(release = %release_id, committed = result.rows_loaded, "Load cancelled");
                    return Err(IngestError::Cancelled);
                },
                next = records.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    self.fail(&state, &e.to_string()).await;
                    return Err(e);
                },
                None => break,
            };

            seen += 1;
            if seen <= resume_from {
                continue;
            }

            batch.push(record);
            if batch.len() >= self.batch_size {
                state = self.commit(release_id, &state, std::mem::take(&mut batch), &mut result).await?;
            }
        }

        if !batch.is_empty() {
            state = self.commit(release_id, &state, batch, &mut result).await?;
        }

        result.rows_skipped = skipped.len();
        self.ledger
            .upsert_state(&state.advance(IngestionStatus::Completed))
            .await?;

        info!(
            release = %release_id,
            rows_loaded = result.rows_loaded,
            rows_upserted = result.rows_upserted,
            rows_unchanged = result.rows_unchanged,
            rows_skipped = result.rows_skipped,
            batches = result.batches,
            "Release loaded"
        );
        Ok(result)
    }

    /// Commit one batch, retrying once, and record the new progress
    async fn commit(
        &self,
        release_id: &ReleaseId,
        state: &IngestionState,
        batch: Vec<TradeRecord>,
        result: &mut LoadResult,
    ) -> Result<IngestionState> {
        let input = batch.len() as u64;
        let unique = dedupe_last_wins(batch);

        let changed = match self.store.upsert_batch(release_id, &unique).await {
            Ok(changed) => changed,
            Err(first) => {
                warn!(release = %release_id, batch = result.batches + 1, error = %first, "Batch failed, retrying once");
                match self.store.upsert_batch(release_id, &unique).await {
                    Ok(changed) => changed,
                    Err(second) => {
                        let detail = format!(
                            "batch {} failed after retry ({} records committed): {}",
                            result.batches + 1,
                            result.rows_loaded,
                            second
                        );
                        self.fail(state, &detail).await;
                        return Err(IngestError::Load(detail));
                    },
                }
            },
        };

        result.batches += 1;
        result.rows_loaded += input;
        result.rows_upserted += changed;
        result.rows_unchanged += (unique.len() as u64).saturating_sub(changed);

        let progress = state.advance(IngestionStatus::Loading).with_rows(result.rows_loaded);
        self.ledger.upsert_state(&progress).await?;
        debug!(release = %release_id, batch = result.batches, committed = result.rows_loaded, changed, "Batch committed");
        Ok(progress)
    }

    async fn fail(&self, state: &IngestionState, detail: &str) {
        if let Err(e) = self.ledger.upsert_state(&state.failed(detail)).await {
            warn!(release = %state.release_id, error = %e, "Could not record load failure");
        }
    }
}

/// Collapse records sharing a natural key, keeping the last one in its first position
pub fn dedupe_last_wins(records: Vec<TradeRecord>) -> Vec<TradeRecord> {
    let mut positions: HashMap<NaturalKey, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<TradeRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.entry(record.natural_key()) {
            Entry::Occupied(slot) => unique[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(record);
            },
        }
    }
    unique
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct FailurePlan {
    pass: u32,
    fail: u32,
}

/// Record store held in process memory, used by tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    rows: Mutex<HashMap<NaturalKey, (TradeRecord, ReleaseId)>>,
    failures: Mutex<FailurePlan>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successes` batches through, then fail the next `failures`
    pub fn fail_after(&self, successes: u32, failures: u32) {
        let mut plan = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        plan.pass = successes;
        plan.fail = failures;
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &NaturalKey) -> Option<TradeRecord> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|(record, _)| record.clone())
    }

    /// Every stored record, ordered by natural key
    pub fn records(&self) -> Vec<TradeRecord> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<TradeRecord> = rows.values().map(|(record, _)| record.clone()).collect();
        records.sort_by_key(TradeRecord::natural_key);
        records
    }

    fn check_failure(&self) -> Result<()> {
        let mut plan = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if plan.pass > 0 {
            plan.pass -= 1;
        } else if plan.fail > 0 {
            plan.fail -= 1;
            return Err(IngestError::load("injected batch failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert_batch(&self, release_id: &ReleaseId, records: &[TradeRecord]) -> Result<u64> {
        self.check_failure()?;

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for record in records {
            let key = record.natural_key();
            let differs = match rows.get(&key) {
                Some((stored, owner)) => !stored.same_values(record) || owner != release_id,
                None => true,
            };
            if differs {
                rows.insert(key, (record.clone(), release_id.clone()));
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_release_rows(&self, release_id: &ReleaseId) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, (_, owner)| owner != release_id);
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_period(&self, from: Option<Period>, to: Option<Period>) -> Result<Vec<PeriodCount>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts: BTreeMap<(Period, TradeFlow), u64> = BTreeMap::new();
        for key in rows.keys() {
            if from.is_some_and(|f| key.period < f) || to.is_some_and(|t| key.period > t) {
                continue;
            }
            *counts.entry((key.period, key.flow)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((period, flow), rows)| PeriodCount { period, flow, rows })
            .collect())
    }
}
