//! Per-release pipeline driver
//!
//! Each release moves through
//! `Discovered → Downloading → Downloaded → Parsing → Loading → Completed`.
//! A run resumes every release from its recorded status: a release left at
//! `Downloaded` is parsed from the staged archive without fetching again, and
//! one left at `Loading` continues after its committed records.
//!
//! Component errors are turned into `Failed` ledger entries here; they never
//! escape [`Orchestrator::run_once`]. Independent releases run in parallel up
//! to the configured concurrency, while the stages of one release run in
//! order and a release is never processed twice at the same time.

use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tradedata_common::{Dataset, Period};

use crate::catalog::SourceCatalog;
use crate::error::{IngestError, Result};
use crate::fetcher::Fetcher;
use crate::ledger::IngestionLedger;
use crate::loader::{Loader, PeriodCount, RecordStore, DEFAULT_BATCH_SIZE};
use crate::models::{
    DownloadArtifact, IngestionState, IngestionStatus, LoadResult, Release, ReleaseId, SkippedRecords, TradeRecord,
};
use crate::parser::Parser;
use crate::retry::RetryPolicy;

/// Parsed records buffered between the parsing thread and the loader
const RECORD_CHANNEL_CAPACITY: usize = 4096;

/// Tuning for [`Orchestrator`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Releases processed in parallel
    pub concurrency: usize,
    /// Keep staged archives after a successful load
    pub keep_artifacts: bool,
    /// Earliest period considered, also passed to the catalog as `since`
    pub start_period: Option<Period>,
    pub end_period: Option<Period>,
    pub datasets: Vec<Dataset>,
    pub batch_size: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            keep_artifacts: false,
            start_period: None,
            end_period: None,
            datasets: Dataset::ALL.to_vec(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Result of processing one release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed(LoadResult),
    /// Nothing to do, the release is already loaded
    AlreadyCompleted,
    /// Another task is processing the release
    AlreadyRunning,
    /// The release failed earlier and waits for an explicit reset
    NeedsReset,
    Failed(String),
    /// Stopped at the last durable stage
    Cancelled,
}

/// Summary of one [`Orchestrator::run_once`] cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// The catalog could not be listed; only ledger work was resumed
    pub catalog_unavailable: bool,
    pub releases_seen: usize,
    pub completed: usize,
    pub failed: Vec<(ReleaseId, String)>,
    pub cancelled: usize,
    pub skipped: usize,
    pub rows_upserted: u64,
    pub rows_skipped: u64,
}

/// A (dataset, period) pair that is not loaded yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRelease {
    pub id: ReleaseId,
    pub dataset: Dataset,
    pub period: Period,
    /// Ledger status, `None` when never discovered
    pub status: Option<IngestionStatus>,
}

/// Drives releases from the catalog through fetch, parse and load
pub struct Orchestrator {
    catalog: Arc<dyn SourceCatalog>,
    fetcher: Fetcher,
    parser: Parser,
    ledger: Arc<dyn IngestionLedger>,
    store: Arc<dyn RecordStore>,
    loader: Loader,
    retry: RetryPolicy,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    in_flight: Mutex<HashSet<ReleaseId>>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        fetcher: Fetcher,
        parser: Parser,
        ledger: Arc<dyn IngestionLedger>,
        store: Arc<dyn RecordStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let loader = Loader::new(store.clone(), ledger.clone(), settings.batch_size);
        Self {
            catalog,
            fetcher,
            parser,
            ledger,
            store,
            loader,
            retry: RetryPolicy::default(),
            settings,
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the pipeline between chunks and batches
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Arc<dyn IngestionLedger> {
        &self.ledger
    }

    /// Run one ingestion cycle over every release that is not finished.
    ///
    /// An unavailable catalog only means no new work this cycle; releases
    /// already in the ledger are still resumed. Failed releases are left for
    /// an explicit [`Orchestrator::reset_release`].
    pub async fn run_once(&self) -> RunReport {
        let mut report = RunReport::default();
        let mut pending: BTreeMap<ReleaseId, Release> = BTreeMap::new();

        match self.catalog.list_releases(self.settings.start_period).await {
            Ok(releases) => {
                for release in releases.into_iter().filter(|r| self.in_scope(r)) {
                    report.releases_seen += 1;
                    match self.ledger.register(&release).await {
                        Ok(state) if state.status.is_terminal() => {
                            debug!(release = %release.id, status = %state.status, "Skipping finished release");
                        },
                        Ok(_) => {
                            pending.insert(release.id.clone(), release);
                        },
                        Err(e) => {
                            error!(release = %release.id, error = %e, "Failed to register release");
                            report.failed.push((release.id, e.to_string()));
                        },
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Catalog unavailable, no new releases this cycle");
                report.catalog_unavailable = true;
            },
        }

        // Releases interrupted by an earlier run, even if the catalog no longer lists them
        for status in IngestionStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let states = match self.ledger.list_by_status(status).await {
                Ok(states) => states,
                Err(e) => {
                    warn!(%status, error = %e, "Failed to list ledger entries");
                    continue;
                },
            };
            for state in states {
                if pending.contains_key(&state.release_id) {
                    continue;
                }
                match self.ledger.release(&state.release_id).await {
                    Ok(Some(release)) if self.in_scope(&release) => {
                        pending.insert(release.id.clone(), release);
                    },
                    Ok(_) => {},
                    Err(e) => warn!(release = %state.release_id, error = %e, "Failed to read release"),
                }
            }
        }

        info!(
            pending = pending.len(),
            concurrency = self.settings.concurrency,
            "Starting ingestion cycle"
        );

        let outcomes: Vec<(ReleaseId, ReleaseOutcome)> = futures::stream::iter(pending.into_values())
            .map(|release| async move {
                let outcome = self.process_release(&release).await;
                (release.id, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (release_id, outcome) in outcomes {
            match outcome {
                ReleaseOutcome::Completed(result) => {
                    report.completed += 1;
                    report.rows_upserted += result.rows_upserted;
                    report.rows_skipped += result.rows_skipped;
                },
                ReleaseOutcome::Failed(detail) => report.failed.push((release_id, detail)),
                ReleaseOutcome::Cancelled => report.cancelled += 1,
                ReleaseOutcome::AlreadyCompleted | ReleaseOutcome::AlreadyRunning | ReleaseOutcome::NeedsReset => {
                    report.skipped += 1
                },
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed.len(),
            cancelled = report.cancelled,
            rows_upserted = report.rows_upserted,
            rows_skipped = report.rows_skipped,
            "Ingestion cycle finished"
        );
        report
    }

    /// Process a single release by identifier.
    ///
    /// The release is looked up in the ledger first, then in the catalog.
    pub async fn run_release(&self, release_id: &ReleaseId) -> Result<ReleaseOutcome> {
        let release = match self.ledger.release(release_id).await? {
            Some(release) => release,
            None => self
                .catalog
                .list_releases(None)
                .await?
                .into_iter()
                .find(|r| &r.id == release_id)
                .ok_or_else(|| IngestError::UnknownRelease(release_id.to_string()))?,
        };
        Ok(self.process_release(&release).await)
    }

    /// Operator reset of a failed release back to `Discovered`.
    ///
    /// With `purge`, rows last written by the release are deleted so the next
    /// run reloads it from scratch.
    pub async fn reset_release(&self, release_id: &ReleaseId, purge: bool) -> Result<IngestionState> {
        let state = self
            .ledger
            .get(release_id)
            .await?
            .ok_or_else(|| IngestError::UnknownRelease(release_id.to_string()))?;

        if state.status != IngestionStatus::Failed {
            return Err(IngestError::InvalidTransition {
                release: release_id.to_string(),
                from: state.status,
                to: IngestionStatus::Discovered,
            });
        }

        if purge {
            let deleted = self.store.delete_release_rows(release_id).await?;
            info!(release = %release_id, deleted, "Purged rows before reset");
        }

        let reset = state.advance(IngestionStatus::Discovered).with_rows(0);
        self.ledger.upsert_state(&reset).await?;
        info!(release = %release_id, "Release reset to discovered");
        Ok(reset)
    }

    /// Every configured (dataset, period) in `from..=to` that is not completed
    pub async fn missing_releases(&self, from: Period, to: Period) -> Result<Vec<MissingRelease>> {
        let mut missing = Vec::new();
        for period in Period::range(from, to) {
            for &dataset in &self.settings.datasets {
                let id = ReleaseId::for_dataset(dataset, period);
                let status = self.ledger.get(&id).await?.map(|s| s.status);
                if status != Some(IngestionStatus::Completed) {
                    missing.push(MissingRelease {
                        id,
                        dataset,
                        period,
                        status,
                    });
                }
            }
        }
        Ok(missing)
    }

    /// Stored rows per period and flow
    pub async fn record_counts(&self, from: Option<Period>, to: Option<Period>) -> Result<Vec<PeriodCount>> {
        self.store.count_by_period(from, to).await
    }

    fn in_scope(&self, release: &Release) -> bool {
        self.settings.datasets.contains(&release.dataset)
            && self.settings.start_period.map_or(true, |start| release.period >= start)
            && self.settings.end_period.map_or(true, |end| release.period <= end)
    }

    async fn process_release(&self, release: &Release) -> ReleaseOutcome {
        if self.cancel.is_cancelled() {
            return ReleaseOutcome::Cancelled;
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight, &release.id) else {
            warn!(release = %release.id, "Release already being processed");
            return ReleaseOutcome::AlreadyRunning;
        };

        match self.drive(release).await {
            Ok(outcome) => outcome,
            Err(IngestError::Cancelled) => {
                info!(release = %release.id, "Release cancelled at last durable stage");
                ReleaseOutcome::Cancelled
            },
            Err(e) => {
                let detail = e.to_string();
                error!(release = %release.id, kind = e.kind(), error = %e, "Release failed");
                self.mark_failed(&release.id, &detail).await;
                ReleaseOutcome::Failed(detail)
            },
        }
    }

    async fn drive(&self, release: &Release) -> Result<ReleaseOutcome> {
        let mut state = self.ledger.register(release).await?;
        match state.status {
            IngestionStatus::Completed => return Ok(ReleaseOutcome::AlreadyCompleted),
            IngestionStatus::Failed => return Ok(ReleaseOutcome::NeedsReset),
            _ => {},
        }
        info!(release = %release.id, status = %state.status, "Processing release");

        let artifact = if state.status.reached(IngestionStatus::Downloaded) {
            match self.fetcher.existing(release).await? {
                Some(artifact) => artifact,
                None => {
                    info!(release = %release.id, "Staged archive missing, downloading again");
                    self.fetch(release).await?
                },
            }
        } else {
            state = state.advance(IngestionStatus::Downloading);
            self.ledger.upsert_state(&state).await?;
            let artifact = self.fetch(release).await?;
            state = state.advance(IngestionStatus::Downloaded);
            self.ledger.upsert_state(&state).await?;
            artifact
        };

        if !state.status.reached(IngestionStatus::Parsing) {
            state = state.advance(IngestionStatus::Parsing);
            self.ledger.upsert_state(&state).await?;
        }

        let skipped = SkippedRecords::new();
        let result = self.parse_and_load(release, &artifact, &skipped).await?;

        if !skipped.is_empty() {
            for record in skipped.records().iter().take(5) {
                debug!(release = %release.id, source = %record.source, line = record.line, reason = %record.reason, "Skipped row");
            }
            warn!(release = %release.id, skipped = skipped.len(), "Rows skipped during parsing");
        }

        if !self.settings.keep_artifacts {
            if let Err(e) = self.fetcher.discard(&artifact).await {
                warn!(release = %release.id, error = %e, "Failed to remove staged archive");
            }
        }

        Ok(ReleaseOutcome::Completed(result))
    }

    async fn fetch(&self, release: &Release) -> Result<DownloadArtifact> {
        let operation = format!("download {}", release.id);
        let fetcher = &self.fetcher;
        let cancel = &self.cancel;
        self.retry
            .run(&operation, cancel, move |attempt| {
                debug!(release = %release.id, attempt, "Downloading");
                fetcher.download(release, cancel)
            })
            .await
    }

    /// Parse on a blocking thread and feed the loader through a bounded channel
    async fn parse_and_load(
        &self,
        release: &Release,
        artifact: &DownloadArtifact,
        skipped: &SkippedRecords,
    ) -> Result<LoadResult> {
        let stream = {
            let parser = self.parser.clone();
            let artifact = artifact.clone();
            let skipped = skipped.clone();
            tokio::task::spawn_blocking(move || parser.parse(&artifact, &skipped)).await??
        };

        let (tx, mut rx) = mpsc::channel::<Result<TradeRecord>>(RECORD_CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();
        let producer = tokio::task::spawn_blocking(move || {
            for item in stream {
                if cancel.is_cancelled() {
                    break;
                }
                let fatal = item.is_err();
                // A closed channel means the loader stopped early
                if tx.blocking_send(item).is_err() || fatal {
                    break;
                }
            }
        });

        let records = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        let loaded = self.loader.load(&release.id, records, skipped, &self.cancel).await;
        producer.await?;
        loaded
    }

    async fn mark_failed(&self, release_id: &ReleaseId, detail: &str) {
        let state = match self.ledger.get(release_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                error!(release = %release_id, error = %e, "Could not read state to record failure");
                return;
            },
        };
        if state.status.is_terminal() {
            return;
        }
        if let Err(e) = self.ledger.upsert_state(&state.failed(detail)).await {
            error!(release = %release_id, error = %e, "Could not record failure");
        }
    }
}

/// Marks a release as in progress for as long as it lives
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ReleaseId>>,
    release_id: ReleaseId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<ReleaseId>>, release_id: &ReleaseId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(release_id.clone());
        inserted.then(|| Self {
            set,
            release_id: release_id.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.release_id);
    }
}
