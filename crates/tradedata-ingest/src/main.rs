//! TradeData Ingest - monthly trade statistics ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tradedata_common::logging::{init_logging, LogConfig};
use tradedata_common::Period;
use tradedata_ingest::catalog::{ArchiveCatalog, HttpIndexCatalog, SourceCatalog};
use tradedata_ingest::config::{CatalogKind, IngestConfig};
use tradedata_ingest::ledger::{IngestionLedger, PgLedger};
use tradedata_ingest::loader::PgRecordStore;
use tradedata_ingest::parser::CodeSets;
use tradedata_ingest::{db, Fetcher, IngestionStatus, Orchestrator, ReleaseId, ReleaseOutcome};

#[derive(Parser, Debug)]
#[command(name = "tradedata-ingest")]
#[command(author, version, about = "UK trade statistics ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./tradedata.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Run one ingestion cycle over every unfinished release
    Run,

    /// Ingest a single release, e.g. smkm46-2020-01
    Release {
        id: String,
    },

    /// Reset a failed release so the next run retries it
    Reset {
        id: String,

        /// Delete rows written by the release before resetting
        #[arg(long)]
        purge: bool,
    },

    /// Show ledger state and stored row counts
    Status {
        /// Only list releases in this status
        #[arg(short, long)]
        status: Option<IngestionStatus>,
    },

    /// List configured releases in a period range that are not loaded
    Missing {
        #[arg(long)]
        from: Period,

        #[arg(long)]
        to: Period,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tradedata-ingest")
        .filter_directives("sqlx=warn,hyper=warn,reqwest=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load(cli.config.as_deref())?;
    let pool = db::create_pool(&config).await?;

    match cli.command {
        Command::Migrate => {
            db::migrate(&pool).await?;
        },
        Command::Run => {
            let orchestrator = build_orchestrator(&config, pool)?;
            let report = orchestrator.run_once().await;

            println!(
                "completed: {}  failed: {}  cancelled: {}  skipped: {}  rows upserted: {}  rows skipped: {}",
                report.completed,
                report.failed.len(),
                report.cancelled,
                report.skipped,
                report.rows_upserted,
                report.rows_skipped
            );
            if report.catalog_unavailable {
                println!("catalog unavailable, only resumed releases were processed");
            }
            for (release, detail) in &report.failed {
                println!("  {} failed: {}", release, detail);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} release(s) failed", report.failed.len());
            }
        },
        Command::Release { id } => {
            let orchestrator = build_orchestrator(&config, pool)?;
            let release_id = ReleaseId::new(id);
            match orchestrator.run_release(&release_id).await? {
                ReleaseOutcome::Completed(result) => println!(
                    "{}: completed ({} rows loaded, {} changed, {} skipped)",
                    release_id, result.rows_loaded, result.rows_upserted, result.rows_skipped
                ),
                ReleaseOutcome::AlreadyCompleted => println!("{}: already completed", release_id),
                ReleaseOutcome::AlreadyRunning => println!("{}: already running", release_id),
                ReleaseOutcome::NeedsReset => {
                    println!("{}: failed earlier, run `reset {}` first", release_id, release_id)
                },
                ReleaseOutcome::Cancelled => println!("{}: cancelled", release_id),
                ReleaseOutcome::Failed(detail) => anyhow::bail!("{}: {}", release_id, detail),
            }
        },
        Command::Reset { id, purge } => {
            let orchestrator = build_orchestrator(&config, pool)?;
            let state = orchestrator.reset_release(&ReleaseId::new(id), purge).await?;
            println!("{}: {}", state.release_id, state.status);
        },
        Command::Status { status } => {
            let ledger = PgLedger::new(pool.clone());
            let statuses = match status {
                Some(status) => vec![status],
                None => IngestionStatus::ALL.to_vec(),
            };
            for status in statuses {
                let states = ledger.list_by_status(status).await?;
                println!("{} ({})", status, states.len());
                for state in states {
                    match &state.error_detail {
                        Some(detail) => println!("  {}  rows={}  {}", state.release_id, state.rows_loaded, detail),
                        None => println!("  {}  rows={}", state.release_id, state.rows_loaded),
                    }
                }
            }

            if status.is_none() {
                let orchestrator = build_orchestrator(&config, pool)?;
                println!("stored rows:");
                for count in orchestrator.record_counts(config.start_period, config.end_period).await? {
                    println!("  {}  {:<6}  {}", count.period, count.flow.as_str(), count.rows);
                }
            }
        },
        Command::Missing { from, to } => {
            if from > to {
                anyhow::bail!("--from ({}) is after --to ({})", from, to);
            }
            let orchestrator = build_orchestrator(&config, pool)?;
            let missing = orchestrator.missing_releases(from, to).await?;
            for release in &missing {
                let status = release.status.map_or("not discovered", |s| s.as_str());
                println!("{}  {}", release.id, status);
            }
            println!("{} release(s) not loaded", missing.len());
        },
    }

    info!("Done");
    Ok(())
}

fn build_orchestrator(config: &IngestConfig, pool: sqlx::PgPool) -> Result<Orchestrator> {
    let client = config.http_client()?;

    let catalog: Arc<dyn SourceCatalog> = match config.catalog_kind {
        CatalogKind::Index => Arc::new(
            HttpIndexCatalog::new(client.clone(), config.source_base_url.clone())
                .with_datasets(config.datasets.clone()),
        ),
        CatalogKind::Archive => {
            let start = config
                .start_period
                .context("start_period is required for the archive catalog")?;
            Arc::new(
                ArchiveCatalog::new(client.clone(), config.source_base_url.clone(), start)
                    .with_datasets(config.datasets.clone())
                    .with_end(config.end_period)
                    .with_scheme(config.archive_scheme),
            )
        },
    };

    let mut codes = match &config.country_codes_path {
        Some(path) => CodeSets::from_lookup_csv(path)?,
        None => CodeSets::builtin(),
    };
    if let Some(path) = &config.commodity_codes_path {
        codes = codes.with_commodity_lookup(path)?;
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next chunk or batch boundary");
            token.cancel();
        }
    });

    Ok(Orchestrator::new(
        catalog,
        Fetcher::new(client, config.staging_dir.clone()),
        tradedata_ingest::Parser::new(Arc::new(codes)),
        Arc::new(PgLedger::new(pool.clone())),
        Arc::new(PgRecordStore::new(pool)),
        config.orchestrator_settings(),
    )
    .with_retry(config.retry_policy())
    .with_cancellation(cancel))
}
