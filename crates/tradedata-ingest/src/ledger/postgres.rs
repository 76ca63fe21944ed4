//! PostgreSQL-backed ingestion ledger

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tradedata_common::checksum::Checksum;
use tradedata_common::{Dataset, Period};

use super::{check_detail, check_transition, IngestionLedger};
use crate::error::{IngestError, Result};
use crate::models::{IngestionState, IngestionStatus, Release, ReleaseId};

#[derive(Debug, FromRow)]
struct StateRow {
    release_id: String,
    status: String,
    updated_at: DateTime<Utc>,
    error_detail: Option<String>,
    rows_loaded: i64,
}

impl TryFrom<StateRow> for IngestionState {
    type Error = IngestError;

    fn try_from(row: StateRow) -> Result<Self> {
        Ok(IngestionState {
            release_id: ReleaseId::new(row.release_id),
            status: IngestionStatus::from_str(&row.status)?,
            updated_at: row.updated_at,
            error_detail: row.error_detail,
            rows_loaded: u64::try_from(row.rows_loaded).unwrap_or(0),
        })
    }
}

#[derive(Debug, FromRow)]
struct ReleaseRow {
    release_id: String,
    dataset: String,
    period: NaiveDate,
    source_url: String,
    checksum: Option<String>,
    expected_size: Option<i64>,
    discovered_at: DateTime<Utc>,
}

impl TryFrom<ReleaseRow> for Release {
    type Error = IngestError;

    fn try_from(row: ReleaseRow) -> Result<Self> {
        let checksum = row.checksum.as_deref().map(Checksum::from_str).transpose()?;
        Ok(Release {
            id: ReleaseId::new(row.release_id),
            dataset: Dataset::from_str(&row.dataset)?,
            period: Period::from_date(row.period),
            url: row.source_url,
            checksum,
            size: row.expected_size.and_then(|s| u64::try_from(s).ok()),
            discovered_at: row.discovered_at,
        })
    }
}

const STATE_COLUMNS: &str = "release_id, status, updated_at, error_detail, rows_loaded";

/// Ledger stored in the `ingestion_state` table
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestionLedger for PgLedger {
    async fn get(&self, release_id: &ReleaseId) -> Result<Option<IngestionState>> {
        let row: Option<StateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ingestion_state WHERE release_id = $1",
            STATE_COLUMNS
        ))
        .bind(release_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        row.map(IngestionState::try_from).transpose()
    }

    async fn upsert_state(&self, state: &IngestionState) -> Result<()> {
        check_detail(state)?;

        let mut tx = self.pool.begin().await.map_err(IngestError::ledger)?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM ingestion_state WHERE release_id = $1 FOR UPDATE")
                .bind(state.release_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(IngestError::ledger)?;

        let current = current.ok_or_else(|| IngestError::UnknownRelease(state.release_id.to_string()))?;
        check_transition(&state.release_id, IngestionStatus::from_str(&current)?, state.status)?;

        sqlx::query(
            r#"
            UPDATE ingestion_state
            SET status = $2, error_detail = $3, rows_loaded = $4, updated_at = $5
            WHERE release_id = $1
            "#,
        )
        .bind(state.release_id.as_str())
        .bind(state.status.as_str())
        .bind(state.error_detail.as_deref())
        .bind(i64::try_from(state.rows_loaded).unwrap_or(i64::MAX))
        .bind(state.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(IngestError::ledger)?;

        tx.commit().await.map_err(IngestError::ledger)?;
        Ok(())
    }

    async fn list_by_status(&self, status: IngestionStatus) -> Result<Vec<IngestionState>> {
        let rows: Vec<StateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ingestion_state WHERE status = $1 ORDER BY release_id",
            STATE_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        rows.into_iter().map(IngestionState::try_from).collect()
    }

    async fn register(&self, release: &Release) -> Result<IngestionState> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_state (
                release_id, dataset, period, source_url, checksum, expected_size,
                discovered_at, status, rows_loaded, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, NOW())
            ON CONFLICT (release_id) DO NOTHING
            "#,
        )
        .bind(release.id.as_str())
        .bind(release.dataset.prefix())
        .bind(release.period.first_day())
        .bind(&release.url)
        .bind(release.checksum.as_ref().map(ToString::to_string))
        .bind(release.size.and_then(|s| i64::try_from(s).ok()))
        .bind(release.discovered_at)
        .bind(IngestionStatus::Discovered.as_str())
        .execute(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        self.get(&release.id)
            .await?
            .ok_or_else(|| IngestError::UnknownRelease(release.id.to_string()))
    }

    async fn release(&self, release_id: &ReleaseId) -> Result<Option<Release>> {
        let row: Option<ReleaseRow> = sqlx::query_as(
            r#"
            SELECT release_id, dataset, period, source_url, checksum, expected_size, discovered_at
            FROM ingestion_state
            WHERE release_id = $1
            "#,
        )
        .bind(release_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        row.map(Release::try_from).transpose()
    }
}
