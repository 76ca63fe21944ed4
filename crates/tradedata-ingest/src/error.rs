//! Error taxonomy for the ingestion pipeline
//!
//! Every stage reports failures through [`IngestError`]. The orchestrator
//! translates them into ledger transitions; they never escape `run_once`.

use thiserror::Error;
use tradedata_common::TradeDataError;

use crate::models::IngestionStatus;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for trade data ingestion
#[derive(Debug, Error)]
pub enum IngestError {
    /// The remote listing could not be retrieved or parsed. Retried next cycle.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Network failure, timeout or server-side error while downloading
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// Client-side HTTP error (4xx). Not retried.
    #[error("Permanent fetch error: {0}")]
    PermanentFetch(String),

    /// Downloaded bytes do not match the published size or checksum
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The archive or its tabular structure is unreadable
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A batch could not be committed after its retry
    #[error("Load error: {0}")]
    Load(String),

    /// The ingestion ledger backing store failed
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Invalid state transition for {release}: {from} -> {to}")]
    InvalidTransition {
        release: String,
        from: IngestionStatus,
        to: IngestionStatus,
    },

    #[error("Unknown release: {0}")]
    UnknownRelease(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] TradeDataError),
}

impl IngestError {
    /// Whether the failing operation may be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::TransientFetch(_) | IngestError::Integrity(_))
    }

    /// Short machine-readable name, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::CatalogUnavailable(_) => "catalog_unavailable",
            IngestError::TransientFetch(_) => "transient_fetch",
            IngestError::PermanentFetch(_) => "permanent_fetch",
            IngestError::Integrity(_) => "integrity",
            IngestError::MalformedInput(_) => "malformed_input",
            IngestError::Load(_) => "load",
            IngestError::Ledger(_) => "ledger",
            IngestError::InvalidTransition { .. } => "invalid_transition",
            IngestError::UnknownRelease(_) => "unknown_release",
            IngestError::Cancelled => "cancelled",
            IngestError::Config(_) => "config",
            IngestError::Io(_) => "io",
            IngestError::Common(_) => "common",
        }
    }

    pub(crate) fn ledger(err: impl std::fmt::Display) -> Self {
        IngestError::Ledger(err.to_string())
    }

    pub(crate) fn load(err: impl std::fmt::Display) -> Self {
        IngestError::Load(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::Io(std::io::Error::other(err))
    }
}
