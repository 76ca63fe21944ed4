//! PostgreSQL ledger and record store tests
//!
//! These start a PostgreSQL container and are ignored by default:
//!
//! ```bash
//! cargo test -p tradedata-ingest --test postgres_tests -- --ignored
//! ```

mod common;

use bigdecimal::BigDecimal;
use common::TestPostgres;
use serial_test::serial;
use std::str::FromStr;
use tradedata_common::{Dataset, Period, TradeFlow};
use tradedata_ingest::ledger::{IngestionLedger, PgLedger};
use tradedata_ingest::loader::{PgRecordStore, RecordStore};
use tradedata_ingest::{IngestError, IngestionStatus, Release, ReleaseId, TradeRecord};

fn record(commodity: &str, partner: &str, value: &str) -> TradeRecord {
    TradeRecord {
        period: "2020-01".parse().unwrap(),
        commodity_code: commodity.to_string(),
        flow: TradeFlow::Import,
        partner_country: partner.to_string(),
        value: BigDecimal::from_str(value).unwrap(),
        net_mass: Some(BigDecimal::from_str("10").unwrap()),
        quantity: None,
        unit: Some("NAR".to_string()),
    }
}

fn release(period: &str) -> Release {
    Release::new(
        Dataset::EuArrivals,
        period.parse().unwrap(),
        format!("https://mirror.test/SMKM46{}.zip", period.replace('-', "").split_at(2).1),
    )
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_upsert_is_idempotent_and_last_write_wins() {
    let pg = TestPostgres::start().await.unwrap();
    let store = PgRecordStore::new(pg.pool_clone());
    let release_id = ReleaseId::new("smkm46-2020-01");

    let batch = vec![record("010121", "FR", "100.00"), record("010121", "DE", "12.00")];
    assert_eq!(store.upsert_batch(&release_id, &batch).await.unwrap(), 2);

    // Same values again change nothing
    assert_eq!(store.upsert_batch(&release_id, &batch).await.unwrap(), 0);

    let update = vec![record("010121", "FR", "105.50")];
    assert_eq!(store.upsert_batch(&release_id, &update).await.unwrap(), 1);

    let (value,): (BigDecimal,) = sqlx::query_as(
        "SELECT value FROM records WHERE commodity_code = '010121' AND partner_country = 'FR'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(value, BigDecimal::from_str("105.50").unwrap());

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_counts_and_purge() {
    let pg = TestPostgres::start().await.unwrap();
    let store = PgRecordStore::new(pg.pool_clone());
    let january = ReleaseId::new("smkm46-2020-01");
    let exports = ReleaseId::new("smke19-2020-01");

    store
        .upsert_batch(&january, &[record("010121", "FR", "1"), record("010129", "FR", "2")])
        .await
        .unwrap();
    let export = TradeRecord {
        flow: TradeFlow::Export,
        ..record("010121", "US", "3")
    };
    store.upsert_batch(&exports, &[export]).await.unwrap();

    let counts = store.count_by_period(None, None).await.unwrap();
    let summary: Vec<(Period, TradeFlow, u64)> = counts.iter().map(|c| (c.period, c.flow, c.rows)).collect();
    let period: Period = "2020-01".parse().unwrap();
    assert_eq!(summary, vec![(period, TradeFlow::Import, 2), (period, TradeFlow::Export, 1)]);

    let later = store
        .count_by_period(Some("2020-02".parse().unwrap()), None)
        .await
        .unwrap();
    assert!(later.is_empty());

    assert_eq!(store.delete_release_rows(&january).await.unwrap(), 2);
    let counts = store.count_by_period(None, None).await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].flow, TradeFlow::Export);
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_ledger_state_machine() {
    let pg = TestPostgres::start().await.unwrap();
    let ledger = PgLedger::new(pg.pool_clone());
    let release = release("2020-01");

    let state = ledger.register(&release).await.unwrap();
    assert_eq!(state.status, IngestionStatus::Discovered);

    // Registering again keeps existing progress
    let downloading = state.advance(IngestionStatus::Downloading);
    ledger.upsert_state(&downloading).await.unwrap();
    let again = ledger.register(&release).await.unwrap();
    assert_eq!(again.status, IngestionStatus::Downloading);

    let stored = ledger.release(&release.id).await.unwrap().unwrap();
    assert_eq!(stored.id, release.id);
    assert_eq!(stored.dataset, Dataset::EuArrivals);
    assert_eq!(stored.period, release.period);
    assert_eq!(stored.url, release.url);

    // Moving backwards is rejected
    let err = ledger
        .upsert_state(&downloading.advance(IngestionStatus::Discovered))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));

    let failed = downloading.failed("HTTP 404");
    ledger.upsert_state(&failed).await.unwrap();
    let listed = ledger.list_by_status(IngestionStatus::Failed).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].error_detail.as_deref(), Some("HTTP 404"));

    // Failed only moves back to Discovered
    let err = ledger
        .upsert_state(&failed.advance(IngestionStatus::Downloading))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));

    let reset = failed.advance(IngestionStatus::Discovered).with_rows(0);
    ledger.upsert_state(&reset).await.unwrap();
    let state = ledger.get(&release.id).await.unwrap().unwrap();
    assert_eq!(state.status, IngestionStatus::Discovered);
    assert_eq!(state.error_detail, None);
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_ledger_tracks_loading_progress() {
    let pg = TestPostgres::start().await.unwrap();
    let ledger = PgLedger::new(pg.pool_clone());
    let release = release("2020-02");

    let mut state = ledger.register(&release).await.unwrap();
    for status in [
        IngestionStatus::Downloading,
        IngestionStatus::Downloaded,
        IngestionStatus::Parsing,
        IngestionStatus::Loading,
    ] {
        state = state.advance(status);
        ledger.upsert_state(&state).await.unwrap();
    }

    ledger.upsert_state(&state.clone().with_rows(1000)).await.unwrap();
    ledger.upsert_state(&state.clone().with_rows(2000)).await.unwrap();

    let stored = ledger.get(&release.id).await.unwrap().unwrap();
    assert_eq!(stored.status, IngestionStatus::Loading);
    assert_eq!(stored.rows_loaded, 2000);

    assert!(ledger.get(&ReleaseId::new("smkm46-1999-01")).await.unwrap().is_none());
}
