//! Domain models shared by the pipeline stages

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tradedata_common::checksum::Checksum;
use tradedata_common::{Dataset, Period, TradeFlow};

use crate::error::IngestError;

// ============================================================================
// Releases
// ============================================================================

/// Identifier of a release, `<prefix>-<yyyy>-<mm>` in lowercase
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(String);

impl ReleaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_ascii_lowercase())
    }

    pub fn for_dataset(dataset: Dataset, period: Period) -> Self {
        Self(format!("{}-{}", dataset.prefix().to_ascii_lowercase(), period))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReleaseId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One published (dataset, month) archive. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub dataset: Dataset,
    pub period: Period,
    pub url: String,
    /// Published digest, when the source advertises one
    pub checksum: Option<Checksum>,
    /// Published byte size, when known
    pub size: Option<u64>,
    pub discovered_at: DateTime<Utc>,
}

impl Release {
    pub fn new(dataset: Dataset, period: Period, url: impl Into<String>) -> Self {
        Self {
            id: ReleaseId::for_dataset(dataset, period),
            dataset,
            period,
            url: url.into(),
            checksum: None,
            size: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn flow(&self) -> TradeFlow {
        self.dataset.flow()
    }
}

/// Local archive produced by the fetcher for a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArtifact {
    pub release_id: ReleaseId,
    pub dataset: Dataset,
    pub period: Period,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Checksum,
    /// Set once size and checksum have been verified
    pub complete: bool,
}

// ============================================================================
// Trade records
// ============================================================================

/// One parsed trade row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub period: Period,
    pub commodity_code: String,
    pub flow: TradeFlow,
    pub partner_country: String,
    /// Declared value in pounds sterling
    pub value: BigDecimal,
    /// Net mass in kilograms
    pub net_mass: Option<BigDecimal>,
    /// Supplementary quantity
    pub quantity: Option<BigDecimal>,
    pub unit: Option<String>,
}

impl TradeRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            period: self.period,
            commodity_code: self.commodity_code.clone(),
            flow: self.flow,
            partner_country: self.partner_country.clone(),
        }
    }

    /// True when every non-key field matches
    pub fn same_values(&self, other: &TradeRecord) -> bool {
        self.value == other.value
            && self.net_mass == other.net_mass
            && self.quantity == other.quantity
            && self.unit == other.unit
    }
}

/// Upsert key of a trade row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub period: Period,
    pub commodity_code: String,
    pub flow: TradeFlow,
    pub partner_country: String,
}

// ============================================================================
// Ingestion state
// ============================================================================

/// Ingestion status of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Discovered,
    Downloading,
    Downloaded,
    Parsing,
    Loading,
    Completed,
    Failed,
}

impl IngestionStatus {
    pub const ALL: [IngestionStatus; 7] = [
        IngestionStatus::Discovered,
        IngestionStatus::Downloading,
        IngestionStatus::Downloaded,
        IngestionStatus::Parsing,
        IngestionStatus::Loading,
        IngestionStatus::Completed,
        IngestionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Discovered => "discovered",
            IngestionStatus::Downloading => "downloading",
            IngestionStatus::Downloaded => "downloaded",
            IngestionStatus::Parsing => "parsing",
            IngestionStatus::Loading => "loading",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Position in the forward pipeline; `None` for `Failed`
    fn stage(&self) -> Option<u8> {
        match self {
            IngestionStatus::Discovered => Some(0),
            IngestionStatus::Downloading => Some(1),
            IngestionStatus::Downloaded => Some(2),
            IngestionStatus::Parsing => Some(3),
            IngestionStatus::Loading => Some(4),
            IngestionStatus::Completed => Some(5),
            IngestionStatus::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionStatus::Completed | IngestionStatus::Failed)
    }

    /// Transitions move forward only. `Failed` is reachable from every
    /// non-terminal status and leaves only through the reset to `Discovered`.
    /// Re-recording the current status is allowed (progress updates).
    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        if *self == next {
            return true;
        }
        match (self.stage(), next.stage()) {
            (None, _) => next == IngestionStatus::Discovered,
            (Some(_), None) => !self.is_terminal(),
            (Some(from), Some(to)) => !self.is_terminal() && to > from,
        }
    }

    /// True for statuses at or past `other` in the forward pipeline
    pub fn reached(&self, other: IngestionStatus) -> bool {
        match (self.stage(), other.stage()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestionStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| IngestError::Ledger(format!("Unknown ingestion status '{}'", s)))
    }
}

/// Durable per-release progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionState {
    pub release_id: ReleaseId,
    pub status: IngestionStatus,
    pub updated_at: DateTime<Utc>,
    /// Set when `status` is `Failed`
    pub error_detail: Option<String>,
    /// Parsed records committed by the loader so far
    pub rows_loaded: u64,
}

impl IngestionState {
    pub fn discovered(release_id: ReleaseId) -> Self {
        Self {
            release_id,
            status: IngestionStatus::Discovered,
            updated_at: Utc::now(),
            error_detail: None,
            rows_loaded: 0,
        }
    }

    /// Same release at a new status; clears any error detail
    pub fn advance(&self, status: IngestionStatus) -> Self {
        Self {
            release_id: self.release_id.clone(),
            status,
            updated_at: Utc::now(),
            error_detail: None,
            rows_loaded: self.rows_loaded,
        }
    }

    pub fn with_rows(mut self, rows_loaded: u64) -> Self {
        self.rows_loaded = rows_loaded;
        self
    }

    /// Failed state preserving the committed row count
    pub fn failed(&self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let detail = if detail.trim().is_empty() {
            "unspecified failure".to_string()
        } else {
            detail
        };
        Self {
            error_detail: Some(detail),
            ..self.advance(IngestionStatus::Failed)
        }
    }
}

// ============================================================================
// Load results and skipped records
// ============================================================================

/// Outcome of loading one release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Rows inserted or changed in storage
    pub rows_upserted: u64,
    /// Committed records that matched the stored row exactly
    pub rows_unchanged: u64,
    /// Rows routed to the skipped-records channel
    pub rows_skipped: u64,
    /// Records committed for the release, including any resumed prefix
    pub rows_loaded: u64,
    pub batches: u64,
}

/// A source row the parser could not turn into a [`TradeRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub release_id: ReleaseId,
    /// Archive member the row came from
    pub source: String,
    pub line: u64,
    pub reason: String,
    pub raw: String,
}

/// Maximum number of skipped rows retained in memory per channel
const MAX_RETAINED_SKIPS: usize = 10_000;

#[derive(Debug, Default)]
struct SkippedInner {
    total: u64,
    retained: Vec<SkippedRecord>,
}

/// Side channel collecting rows that were skipped during parsing.
///
/// Cheap to clone; clones share the same buffer. Only the first
/// 10 000 rows are retained, but every skip is counted.
#[derive(Debug, Clone, Default)]
pub struct SkippedRecords {
    inner: Arc<Mutex<SkippedInner>>,
}

impl SkippedRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: SkippedRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.total += 1;
        if inner.retained.len() < MAX_RETAINED_SKIPS {
            inner.retained.push(record);
        }
    }

    /// Number of skipped rows seen
    pub fn len(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the retained rows
    pub fn records(&self) -> Vec<SkippedRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retained
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use IngestionStatus::*;

    #[test]
    fn test_release_id_format() {
        let period: Period = "2020-01".parse().unwrap();
        let id = ReleaseId::for_dataset(Dataset::EuArrivals, period);
        assert_eq!(id.as_str(), "smkm46-2020-01");
        assert_eq!(ReleaseId::from(" SMKM46-2020-01 "), id);
    }

    #[test]
    fn test_forward_transitions() {
        assert!(Discovered.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Downloaded));
        assert!(Downloaded.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Completed));
        assert!(Loading.can_transition_to(Loading));
        assert!(Discovered.can_transition_to(Downloaded));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!Loading.can_transition_to(Downloading));
        assert!(!Downloaded.can_transition_to(Discovered));
        assert!(!Completed.can_transition_to(Loading));
        assert!(!Completed.can_transition_to(Discovered));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_failed_transitions() {
        for status in [Discovered, Downloading, Downloaded, Parsing, Loading] {
            assert!(status.can_transition_to(Failed), "{} -> failed", status);
        }
        assert!(Failed.can_transition_to(Discovered));
        assert!(!Failed.can_transition_to(Loading));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trip() {
        for status in IngestionStatus::ALL {
            assert_eq!(status.as_str().parse::<IngestionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<IngestionStatus>().is_err());
    }

    #[test]
    fn test_failed_state_always_has_detail() {
        let state = IngestionState::discovered("smke19-2020-01".into()).with_rows(40);
        let failed = state.failed("  ");
        assert_eq!(failed.status, Failed);
        assert_eq!(failed.rows_loaded, 40);
        assert!(!failed.error_detail.unwrap().is_empty());
    }

    #[test]
    fn test_skipped_records_counts_beyond_retention() {
        let skipped = SkippedRecords::new();
        let clone = skipped.clone();
        for line in 0..(MAX_RETAINED_SKIPS as u64 + 5) {
            clone.push(SkippedRecord {
                release_id: "smke19-2020-01".into(),
                source: "SMKE192001".into(),
                line,
                reason: "bad".into(),
                raw: String::new(),
            });
        }
        assert_eq!(skipped.len(), MAX_RETAINED_SKIPS as u64 + 5);
        assert_eq!(skipped.records().len(), MAX_RETAINED_SKIPS);
    }
}
