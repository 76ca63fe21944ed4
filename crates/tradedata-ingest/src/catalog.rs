//! Release discovery
//!
//! A [`SourceCatalog`] lists the releases the publisher currently offers. The
//! listing is re-queried on every call; nothing is cached between cycles.
//!
//! Two catalogs are provided:
//!
//! - [`HttpIndexCatalog`] reads a JSON index at `{base}/index.json`
//! - [`ArchiveCatalog`] enumerates the conventional archive URLs, either one
//!   per month (`{base}SMKE192001.zip`) or the yearly bulk archives
//!   (`{base}SMKE19_2019archive.zip`), and optionally probes each with `HEAD`
//!
//! A yearly archive yields one release per month it covers, all pointing at the
//! same archive; the parser keeps only the members named for the release month.

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{header::CONTENT_LENGTH, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use tradedata_common::checksum::Checksum;
use tradedata_common::{Dataset, Period};

use crate::error::{IngestError, Result};
use crate::models::Release;

/// Concurrent `HEAD` probes issued by [`ArchiveCatalog`]
const PROBE_CONCURRENCY: usize = 8;

/// Source of available releases
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// List releases for periods at or after `since`, ordered by period then dataset.
    ///
    /// Fails with [`IngestError::CatalogUnavailable`] when the listing cannot be
    /// retrieved or parsed.
    async fn list_releases(&self, since: Option<Period>) -> Result<Vec<Release>>;
}

/// Join a base URL and a relative path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn sort_releases(releases: &mut [Release]) {
    releases.sort_by(|a, b| (a.period, a.dataset).cmp(&(b.period, b.dataset)));
}

// ============================================================================
// JSON index catalog
// ============================================================================

#[derive(Debug, Deserialize)]
struct IndexDocument {
    releases: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    dataset: Dataset,
    period: Period,
    url: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Catalog backed by a machine-readable index document
///
/// ```json
/// { "releases": [
///     { "dataset": "SMKM46", "period": "2020-01", "url": "SMKM462001.zip",
///       "checksum": "sha256:…", "size": 1048576 }
/// ] }
/// ```
///
/// Relative URLs are resolved against the base URL.
pub struct HttpIndexCatalog {
    client: Client,
    base_url: String,
    datasets: Vec<Dataset>,
}

impl HttpIndexCatalog {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            datasets: Dataset::ALL.to_vec(),
        }
    }

    /// Restrict the listing to the given dataset families
    pub fn with_datasets(mut self, datasets: Vec<Dataset>) -> Self {
        self.datasets = datasets;
        self
    }

    pub fn index_url(&self) -> String {
        join_url(&self.base_url, "index.json")
    }

    fn into_release(&self, entry: IndexEntry) -> Result<Release> {
        let url = join_url(&self.base_url, &entry.url);
        let mut release = Release::new(entry.dataset, entry.period, url);
        if let Some(raw) = entry.checksum.as_deref().filter(|c| !c.trim().is_empty()) {
            let checksum: Checksum = raw.parse().map_err(|e| {
                IngestError::CatalogUnavailable(format!("Bad checksum for {}: {}", release.id, e))
            })?;
            release = release.with_checksum(checksum);
        }
        if let Some(size) = entry.size {
            release = release.with_size(size);
        }
        Ok(release)
    }
}

#[async_trait]
impl SourceCatalog for HttpIndexCatalog {
    async fn list_releases(&self, since: Option<Period>) -> Result<Vec<Release>> {
        let url = self.index_url();
        debug!("Fetching release index from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IngestError::CatalogUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(IngestError::CatalogUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::CatalogUnavailable(format!("{}: {}", url, e)))?;
        let document: IndexDocument = serde_json::from_slice(&body).map_err(|e| {
            IngestError::CatalogUnavailable(format!("Unparseable index {}: {}", url, e))
        })?;

        let mut releases = Vec::with_capacity(document.releases.len());
        for entry in document.releases {
            if !self.datasets.contains(&entry.dataset) {
                continue;
            }
            if since.is_some_and(|since| entry.period < since) {
                continue;
            }
            releases.push(self.into_release(entry)?);
        }
        sort_releases(&mut releases);

        info!(count = releases.len(), "Release index listed");
        Ok(releases)
    }
}

// ============================================================================
// Conventional archive catalog
// ============================================================================

/// First year whose bulk archives are split into January-June and July-December
const SPLIT_YEAR_ARCHIVES_FROM: i32 = 2016;

/// Archive naming scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveScheme {
    /// `{PREFIX}{yymm}.zip`, one archive per month
    #[default]
    Monthly,
    /// `{PREFIX}_{yyyy}archive.zip`, plus `{PREFIX}_{yyyy}archive_JulDec.zip`
    /// for the second half of split years
    Yearly,
}

/// Catalog that derives archive URLs from the publisher's naming scheme
pub struct ArchiveCatalog {
    client: Client,
    base_url: String,
    datasets: Vec<Dataset>,
    start: Period,
    end: Option<Period>,
    probe: bool,
    scheme: ArchiveScheme,
}

impl ArchiveCatalog {
    pub fn new(client: Client, base_url: impl Into<String>, start: Period) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            datasets: Dataset::ALL.to_vec(),
            start,
            end: None,
            probe: true,
            scheme: ArchiveScheme::Monthly,
        }
    }

    pub fn with_datasets(mut self, datasets: Vec<Dataset>) -> Self {
        self.datasets = datasets;
        self
    }

    /// Last period to enumerate; defaults to the current month
    pub fn with_end(mut self, end: Option<Period>) -> Self {
        self.end = end;
        self
    }

    /// Whether to `HEAD` each archive to drop months not yet published
    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_scheme(mut self, scheme: ArchiveScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Archive URL holding one dataset and month
    pub fn archive_url(&self, dataset: Dataset, period: Period) -> String {
        match self.scheme {
            ArchiveScheme::Monthly => format!("{}{}{}.zip", self.base_url, dataset.prefix(), period.yymm()),
            ArchiveScheme::Yearly if period.year() >= SPLIT_YEAR_ARCHIVES_FROM && period.month() >= 7 => {
                format!("{}{}_{}archive_JulDec.zip", self.base_url, dataset.prefix(), period.year())
            },
            ArchiveScheme::Yearly => {
                format!("{}{}_{}archive.zip", self.base_url, dataset.prefix(), period.year())
            },
        }
    }

    fn candidates(&self, since: Option<Period>) -> Vec<Release> {
        let start = since.map_or(self.start, |since| since.max(self.start));
        let end = self
            .end
            .unwrap_or_else(|| Period::from_date(Utc::now().date_naive()));

        Period::range(start, end)
            .flat_map(|period| {
                self.datasets
                    .iter()
                    .map(move |dataset| (*dataset, period))
            })
            .map(|(dataset, period)| Release::new(dataset, period, self.archive_url(dataset, period)))
            .collect()
    }

    /// `Some(size)` when published, `None` when the server reports it missing.
    /// The size is zero when the server does not send one.
    async fn probe(&self, url: String) -> Result<(String, Option<u64>)> {
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| IngestError::CatalogUnavailable(format!("{}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok((url, Some(size)))
            },
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
                debug!(url = %url, "Archive not published");
                Ok((url, None))
            },
            status => Err(IngestError::CatalogUnavailable(format!("{}: HTTP {}", url, status))),
        }
    }
}

#[async_trait]
impl SourceCatalog for ArchiveCatalog {
    async fn list_releases(&self, since: Option<Period>) -> Result<Vec<Release>> {
        let candidates = self.candidates(since);
        if !self.probe {
            return Ok(candidates);
        }

        // Months sharing a yearly archive need one HEAD request
        let mut urls: Vec<String> = candidates.iter().map(|r| r.url.clone()).collect();
        urls.sort();
        urls.dedup();

        let archives = urls.len();
        let published: HashMap<String, Option<u64>> = stream::iter(urls)
            .map(|url| self.probe(url))
            .buffered(PROBE_CONCURRENCY)
            .try_collect()
            .await?;

        let total = candidates.len();
        let mut releases: Vec<Release> = candidates
            .into_iter()
            .filter_map(|release| match published.get(&release.url).copied().flatten() {
                Some(0) => Some(release),
                Some(size) => Some(release.with_size(size)),
                None => None,
            })
            .collect();
        sort_releases(&mut releases);

        info!(
            candidates = total,
            archives,
            published = releases.len(),
            scheme = ?self.scheme,
            "Archive catalog probed"
        );
        Ok(releases)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://host/data/", "/a.zip"), "http://host/data/a.zip");
        assert_eq!(join_url("http://host/data", "a.zip"), "http://host/data/a.zip");
        assert_eq!(join_url("http://host", "https://cdn/a.zip"), "https://cdn/a.zip");
    }

    #[test]
    fn test_archive_candidates() {
        let catalog = ArchiveCatalog::new(
            Client::new(),
            "https://www.uktradeinfo.com/Statistics/Documents/Data Downloads/",
            "2019-12".parse().unwrap(),
        )
        .with_datasets(vec![Dataset::NonEuExports, Dataset::EuArrivals])
        .with_end(Some("2020-01".parse().unwrap()));

        let releases = catalog.candidates(None);
        let ids: Vec<&str> = releases.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["smke19-2019-12", "smkm46-2019-12", "smke19-2020-01", "smkm46-2020-01"]
        );
        assert!(releases[2].url.ends_with("Data Downloads/SMKE192001.zip"));

        let later = catalog.candidates(Some("2020-01".parse().unwrap()));
        assert_eq!(later.len(), 2);
    }

    #[test]
    fn test_yearly_archive_urls() {
        let catalog = ArchiveCatalog::new(Client::new(), "http://host/", "2015-01".parse().unwrap())
            .with_scheme(ArchiveScheme::Yearly);
        let url = |dataset, period: &str| catalog.archive_url(dataset, period.parse().unwrap());

        assert_eq!(url(Dataset::NonEuExports, "2015-11"), "http://host/SMKE19_2015archive.zip");
        assert_eq!(url(Dataset::EuArrivals, "2016-06"), "http://host/SMKM46_2016archive.zip");
        assert_eq!(url(Dataset::EuArrivals, "2016-07"), "http://host/SMKM46_2016archive_JulDec.zip");
        assert_eq!(url(Dataset::NonEuImports, "2019-12"), "http://host/SMKI19_2019archive_JulDec.zip");
    }
}
