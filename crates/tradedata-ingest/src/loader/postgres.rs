//! PostgreSQL record store
//!
//! Rows live in the `records` table keyed by `(period, commodity_code, flow,
//! partner_country)`. An upsert only touches a row when a value or the owning
//! release differs, so `rows_affected` counts real changes.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use tradedata_common::{Period, TradeFlow};

use super::{PeriodCount, RecordStore};
use crate::error::{IngestError, Result};
use crate::models::{ReleaseId, TradeRecord};

/// Record store backed by the `records` table
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_batch(&self, release_id: &ReleaseId, records: &[TradeRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(IngestError::load)?;

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO records (
                period,
                commodity_code,
                flow,
                partner_country,
                value,
                net_mass,
                quantity,
                unit,
                release_id
            )
            "#,
        );

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(record.period.first_day())
                .push_bind(&record.commodity_code)
                .push_bind(record.flow.as_str())
                .push_bind(&record.partner_country)
                .push_bind(&record.value)
                .push_bind(&record.net_mass)
                .push_bind(&record.quantity)
                .push_bind(&record.unit)
                .push_bind(release_id.as_str());
        });

        query_builder.push(
            r#"
            ON CONFLICT (period, commodity_code, flow, partner_country)
            DO UPDATE SET
                value = EXCLUDED.value,
                net_mass = EXCLUDED.net_mass,
                quantity = EXCLUDED.quantity,
                unit = EXCLUDED.unit,
                release_id = EXCLUDED.release_id,
                updated_at = NOW()
            WHERE (records.value, records.net_mass, records.quantity, records.unit, records.release_id)
                IS DISTINCT FROM
                (EXCLUDED.value, EXCLUDED.net_mass, EXCLUDED.quantity, EXCLUDED.unit, EXCLUDED.release_id)
            "#,
        );

        let changed = query_builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(IngestError::load)?
            .rows_affected();

        tx.commit().await.map_err(IngestError::load)?;
        Ok(changed)
    }

    async fn delete_release_rows(&self, release_id: &ReleaseId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE release_id = $1")
            .bind(release_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(IngestError::load)?;
        Ok(result.rows_affected())
    }

    async fn count_by_period(&self, from: Option<Period>, to: Option<Period>) -> Result<Vec<PeriodCount>> {
        let rows: Vec<(NaiveDate, String, i64)> = sqlx::query_as(
            r#"
            SELECT period, flow, COUNT(*)
            FROM records
            WHERE ($1::date IS NULL OR period >= $1)
              AND ($2::date IS NULL OR period <= $2)
            GROUP BY period, flow
            ORDER BY period, flow DESC
            "#,
        )
        .bind(from.map(|p| p.first_day()))
        .bind(to.map(|p| p.first_day()))
        .fetch_all(&self.pool)
        .await
        .map_err(IngestError::load)?;

        rows.into_iter()
            .map(|(period, flow, rows)| -> Result<PeriodCount> {
                Ok(PeriodCount {
                    period: Period::from_date(period),
                    flow: TradeFlow::from_str(&flow)?,
                    rows: u64::try_from(rows).unwrap_or(0),
                })
            })
            .collect()
    }
}
