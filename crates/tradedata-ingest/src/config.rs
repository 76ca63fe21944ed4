//! Configuration management
//!
//! Values are layered: built-in defaults, then an optional `tradedata.toml`
//! (or `.yaml`/`.json`) in the working directory or an explicit file, then
//! `TRADEDATA_*` environment variables. A `.env` file is read first.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tradedata_common::{Dataset, Period};

use crate::catalog::ArchiveScheme;
use crate::loader::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::orchestrator::OrchestratorSettings;
use crate::retry::RetryPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Directory the publisher serves monthly archives from.
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://www.uktradeinfo.com/Statistics/Documents/Data%20Downloads/";

/// Default staging directory for in-flight downloads.
pub const DEFAULT_STAGING_DIR: &str = "./data/staging";

/// First period enumerated by the archive catalog.
pub const DEFAULT_START_PERIOD: &str = "2016-01";

/// Default retries after the first attempt of a stage.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff unit in seconds.
pub const DEFAULT_BACKOFF_BASE_SECONDS: u64 = 2;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tradedata";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default number of releases processed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Name of the optional configuration file, without extension.
pub const CONFIG_FILE_NAME: &str = "tradedata";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "TRADEDATA";

/// How releases are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// JSON index published at `{source_base_url}/index.json`
    Index,
    /// Conventional monthly or yearly archive URLs, checked with `HEAD`
    Archive,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub source_base_url: String,
    pub staging_dir: PathBuf,
    /// Records per load transaction
    pub batch_size: usize,
    /// Retries per stage after the first attempt
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub database_url: String,
    pub database_max_connections: u32,
    pub catalog_kind: CatalogKind,
    /// Monthly or yearly archive names, for the archive catalog
    pub archive_scheme: ArchiveScheme,
    pub start_period: Option<Period>,
    pub end_period: Option<Period>,
    pub concurrency: usize,
    pub keep_artifacts: bool,
    /// `name,code,seq` country lookup replacing the built-in code set
    pub country_codes_path: Option<PathBuf>,
    /// Commodity lookup (SMKA12 control file or CSV); unlisted codes are skipped
    pub commodity_codes_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub datasets: Vec<Dataset>,
}

impl IngestConfig {
    /// Load configuration from defaults, files and environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let datasets: Vec<String> = Dataset::ALL.iter().map(|d| d.prefix().to_string()).collect();

        let mut builder = config::Config::builder()
            .set_default("source_base_url", DEFAULT_SOURCE_BASE_URL)?
            .set_default("staging_dir", DEFAULT_STAGING_DIR)?
            .set_default("batch_size", DEFAULT_BATCH_SIZE as i64)?
            .set_default("max_retries", i64::from(DEFAULT_MAX_RETRIES))?
            .set_default("backoff_base_seconds", DEFAULT_BACKOFF_BASE_SECONDS as i64)?
            .set_default("database_url", DEFAULT_DATABASE_URL)?
            .set_default("database_max_connections", i64::from(DEFAULT_DATABASE_MAX_CONNECTIONS))?
            .set_default("catalog_kind", "archive")?
            .set_default("archive_scheme", "monthly")?
            .set_default("start_period", DEFAULT_START_PERIOD)?
            .set_default("concurrency", DEFAULT_CONCURRENCY as i64)?
            .set_default("keep_artifacts", false)?
            .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS as i64)?
            .set_default("datasets", datasets)?;

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name(CONFIG_FILE_NAME).required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("datasets"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: IngestConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_base_url.trim().is_empty() {
            anyhow::bail!("source_base_url cannot be empty");
        }

        if self.database_url.trim().is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!(
                "batch_size must be between 1 and {} (got {})",
                MAX_BATCH_SIZE,
                self.batch_size
            );
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if let (Some(start), Some(end)) = (self.start_period, self.end_period) {
            if start > end {
                anyhow::bail!("start_period ({}) is after end_period ({})", start, end);
            }
        }

        if self.catalog_kind == CatalogKind::Archive && self.start_period.is_none() {
            anyhow::bail!("start_period is required for the archive catalog");
        }

        if self.datasets.is_empty() {
            anyhow::bail!("At least one dataset must be configured");
        }

        if (self.database_max_connections as usize) < self.concurrency {
            tracing::warn!(
                concurrency = self.concurrency,
                max_connections = self.database_max_connections,
                "Fewer database connections than parallel releases"
            );
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.backoff_base_seconds))
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            concurrency: self.concurrency,
            keep_artifacts: self.keep_artifacts,
            start_period: self.start_period,
            end_period: self.end_period,
            datasets: self.datasets.clone(),
            batch_size: self.batch_size,
        }
    }

    /// HTTP client shared by the catalog and the fetcher
    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("tradedata-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_seconds: DEFAULT_BACKOFF_BASE_SECONDS,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            catalog_kind: CatalogKind::Archive,
            archive_scheme: ArchiveScheme::Monthly,
            start_period: DEFAULT_START_PERIOD.parse().ok(),
            end_period: None,
            concurrency: DEFAULT_CONCURRENCY,
            keep_artifacts: false,
            country_codes_path: None,
            commodity_codes_path: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            datasets: Dataset::ALL.to_vec(),
        }
    }
}
