//! Catalog tests against a mock publisher

mod common;

use common::{index_entry, mount_index, sha256};
use tradedata_common::Dataset;
use tradedata_ingest::catalog::{ArchiveCatalog, ArchiveScheme, HttpIndexCatalog, SourceCatalog};
use tradedata_ingest::IngestError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_index_lists_releases_in_period_order() {
    common::init_tracing();
    let server = MockServer::start().await;
    mount_index(
        &server,
        vec![
            index_entry("SMKM46", "2020-02", "SMKM462002.zip", b"feb"),
            index_entry("SMKE19", "2020-01", "SMKE192001.zip", b"jan"),
            serde_json::json!({
                "dataset": "SMKX46",
                "period": "2020-01",
                "url": "https://cdn.example/SMKX462001.zip",
            }),
        ],
    )
    .await;

    let catalog = HttpIndexCatalog::new(reqwest::Client::new(), server.uri());
    let releases = catalog.list_releases(None).await.unwrap();

    let ids: Vec<&str> = releases.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["smke19-2020-01", "smkx46-2020-01", "smkm46-2020-02"]);

    let exports = &releases[0];
    assert_eq!(exports.url, format!("{}/SMKE192001.zip", server.uri()));
    assert_eq!(exports.checksum, Some(sha256(b"jan")));
    assert_eq!(exports.size, Some(3));

    // Absolute URLs are kept, and integrity metadata is optional
    assert_eq!(releases[1].url, "https://cdn.example/SMKX462001.zip");
    assert_eq!(releases[1].checksum, None);
}

#[tokio::test]
async fn test_index_filters_by_period_and_dataset() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        vec![
            index_entry("SMKM46", "2019-12", "SMKM461912.zip", b"a"),
            index_entry("SMKM46", "2020-01", "SMKM462001.zip", b"b"),
            index_entry("SMKE19", "2020-01", "SMKE192001.zip", b"c"),
        ],
    )
    .await;

    let catalog =
        HttpIndexCatalog::new(reqwest::Client::new(), server.uri()).with_datasets(vec![Dataset::EuArrivals]);
    let releases = catalog.list_releases(Some("2020-01".parse().unwrap())).await.unwrap();

    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].id.as_str(), "smkm46-2020-01");
}

#[tokio::test]
async fn test_index_errors_mean_catalog_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let catalog = HttpIndexCatalog::new(reqwest::Client::new(), server.uri());
    let err = catalog.list_releases(None).await.unwrap_err();
    assert!(matches!(err, IngestError::CatalogUnavailable(_)));

    let garbled = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&garbled)
        .await;

    let catalog = HttpIndexCatalog::new(reqwest::Client::new(), garbled.uri());
    let err = catalog.list_releases(None).await.unwrap_err();
    assert!(matches!(err, IngestError::CatalogUnavailable(_)));
}

#[tokio::test]
async fn test_archive_catalog_drops_unpublished_months() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/SMKM461912.zip"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // SMKM462001.zip is not mounted and answers 404

    let catalog = ArchiveCatalog::new(
        reqwest::Client::new(),
        format!("{}/", server.uri()),
        "2019-12".parse().unwrap(),
    )
    .with_datasets(vec![Dataset::EuArrivals])
    .with_end(Some("2020-01".parse().unwrap()));

    let releases = catalog.list_releases(None).await.unwrap();

    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].id.as_str(), "smkm46-2019-12");
    assert_eq!(releases[0].url, format!("{}/SMKM461912.zip", server.uri()));
}

#[tokio::test]
async fn test_archive_catalog_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let catalog = ArchiveCatalog::new(
        reqwest::Client::new(),
        format!("{}/", server.uri()),
        "2020-01".parse().unwrap(),
    )
    .with_datasets(vec![Dataset::NonEuImports])
    .with_end(Some("2020-01".parse().unwrap()));

    let err = catalog.list_releases(None).await.unwrap_err();
    assert!(matches!(err, IngestError::CatalogUnavailable(_)));

    // Without probing the candidates are returned as-is
    let releases = catalog.with_probe(false).list_releases(None).await.unwrap();
    assert_eq!(releases.len(), 1);
}

#[tokio::test]
async fn test_yearly_archives_fan_out_into_monthly_releases() {
    let server = MockServer::start().await;
    // One HEAD request per archive and listing, however many months it holds
    Mock::given(method("HEAD"))
        .and(path("/SMKM46_2016archive.zip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/SMKM46_2016archive_JulDec.zip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    // 2017 not published yet

    let catalog = ArchiveCatalog::new(
        reqwest::Client::new(),
        format!("{}/", server.uri()),
        "2016-05".parse().unwrap(),
    )
    .with_datasets(vec![Dataset::EuArrivals])
    .with_end(Some("2017-01".parse().unwrap()))
    .with_scheme(ArchiveScheme::Yearly);

    let releases = catalog.list_releases(None).await.unwrap();

    let ids: Vec<&str> = releases.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "smkm46-2016-05",
            "smkm46-2016-06",
            "smkm46-2016-07",
            "smkm46-2016-08",
            "smkm46-2016-09",
            "smkm46-2016-10",
            "smkm46-2016-11",
            "smkm46-2016-12",
        ]
    );
    assert_eq!(releases[1].url, format!("{}/SMKM46_2016archive.zip", server.uri()));
    assert_eq!(releases[2].url, format!("{}/SMKM46_2016archive_JulDec.zip", server.uri()));

    let since = catalog.list_releases(Some("2016-12".parse().unwrap())).await;
    assert_eq!(since.unwrap().len(), 1);
}
