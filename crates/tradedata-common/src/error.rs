//! Error types for TradeData

use thiserror::Error;

/// Result type alias for common TradeData operations
pub type Result<T> = std::result::Result<T, TradeDataError>;

/// Error type shared by the TradeData crates
#[derive(Error, Debug)]
pub enum TradeDataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Invalid trade flow: {0}")]
    InvalidFlow(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
