//! TradeData ingestion pipeline
//!
//! Resumable, idempotent bulk ingestion of monthly UK trade statistics.
//!
//! # Stages
//!
//! - [`catalog`]: enumerates published releases
//! - [`fetcher`]: resumable, checksum-verified downloads into a staging directory
//! - [`parser`]: per-era column layouts decoded into exact-decimal records
//! - [`loader`]: natural-key upserts in bounded, retried batches
//! - [`ledger`]: durable per-release state machine
//! - [`orchestrator`]: drives every release through the stages above
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tradedata_ingest::catalog::HttpIndexCatalog;
//! use tradedata_ingest::ledger::InMemoryLedger;
//! use tradedata_ingest::loader::InMemoryRecordStore;
//! use tradedata_ingest::{Fetcher, Orchestrator, OrchestratorSettings, Parser};
//!
//! # async fn example() {
//! let client = reqwest::Client::new();
//! let orchestrator = Orchestrator::new(
//!     Arc::new(HttpIndexCatalog::new(client.clone(), "https://mirror.example/trade")),
//!     Fetcher::new(client, "./data/staging"),
//!     Parser::default(),
//!     Arc::new(InMemoryLedger::new()),
//!     Arc::new(InMemoryRecordStore::new()),
//!     OrchestratorSettings::default(),
//! );
//!
//! let report = orchestrator.run_once().await;
//! tracing::info!(completed = report.completed, failed = report.failed.len(), "done");
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod retry;

pub use error::{IngestError, Result};
pub use fetcher::Fetcher;
pub use models::{
    DownloadArtifact, IngestionState, IngestionStatus, LoadResult, Release, ReleaseId, SkippedRecord,
    SkippedRecords, TradeRecord,
};
pub use orchestrator::{MissingRelease, Orchestrator, OrchestratorSettings, ReleaseOutcome, RunReport};
pub use parser::Parser;
