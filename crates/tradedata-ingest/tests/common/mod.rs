//! Shared fixtures for ingestion integration tests
//!
//! - zip archive builders in the publisher's file layouts
//! - wiremock helpers serving archives and the JSON release index
//! - a PostgreSQL test container with migrations applied

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::{Cursor, Write};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tradedata_common::checksum::{Checksum, ChecksumAlgorithm};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Header row of the 2016-2020 pipe-delimited files
pub const PIPE_HEADER: &str = "COMCODE|COD-ALPHA|ACCOUNT-PERIOD|VALUE|NET-MASS|SUPP-UNIT|UNIT";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tradedata_ingest=debug")
        .with_test_writer()
        .try_init();
}

/// Zip archive holding the given `(name, contents)` members
pub fn zip_archive(members: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in members {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip member");
        writer.write_all(contents.as_bytes()).expect("write zip member");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Zip archive of binary members, such as monthly archives inside a yearly one
pub fn nested_archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in members {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip member");
        writer.write_all(contents).expect("write zip member");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Pipe-delimited member for January 2020 from `(commodity, partner, value)` rows
pub fn pipe_member(rows: &[(&str, &str, &str)]) -> String {
    let mut out = String::from(PIPE_HEADER);
    out.push('\n');
    for (commodity, partner, value) in rows {
        out.push_str(&format!("{}|{}|01/2020|{}|10|1|NAR\n", commodity, partner, value));
    }
    out
}

/// Pipe-delimited member with `count` distinct valid rows for January 2020
pub fn generated_member(count: usize) -> String {
    let mut out = String::with_capacity(count * 40);
    out.push_str(PIPE_HEADER);
    out.push('\n');
    let partners = ["FR", "DE", "IT", "ES", "NL", "BE", "IE", "PL"];
    for i in 0..count {
        let commodity = format!("{:08}", 1_010_000 + i / partners.len());
        let partner = partners[i % partners.len()];
        out.push_str(&format!("{}|{}|01/2020|{}.{:02}|5|1|NAR\n", commodity, partner, i, i % 100));
    }
    out
}

pub fn sha256(bytes: &[u8]) -> Checksum {
    Checksum::of_reader(&mut &bytes[..], ChecksumAlgorithm::Sha256).expect("checksum")
}

/// JSON index entry for a release served by `server`
pub fn index_entry(dataset: &str, period: &str, file: &str, archive: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "dataset": dataset,
        "period": period,
        "url": file,
        "checksum": sha256(archive).to_string(),
        "size": archive.len(),
    })
}

/// Serve `/index.json` listing `entries`
pub async fn mount_index(server: &MockServer, entries: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "releases": entries })))
        .mount(server)
        .await;
}

/// Serve `archive` at `/<file>`
pub async fn mount_archive(server: &MockServer, file: &str, archive: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(server)
        .await;
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}
