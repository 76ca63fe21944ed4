//! Resumable, verified archive downloads
//!
//! Each release is staged at `<staging_dir>/<release-id>.zip.part`. An
//! interrupted transfer keeps its partial file and the next attempt continues
//! with a `Range` request. Once the transfer finishes, size and checksum are
//! verified and the file is renamed to `<release-id>.zip`.

use futures::StreamExt;
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    Client, Response, StatusCode,
};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tradedata_common::checksum::{Checksum, ChecksumAlgorithm};

use crate::error::{IngestError, Result};
use crate::models::{DownloadArtifact, Release};

/// Downloads release archives into a staging directory
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    staging_dir: PathBuf,
}

impl Fetcher {
    pub fn new(client: Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Final location of the archive for `release`
    pub fn artifact_path(&self, release: &Release) -> PathBuf {
        self.staging_dir.join(format!("{}.zip", release.id))
    }

    /// Location of the in-flight partial download for `release`
    pub fn partial_path(&self, release: &Release) -> PathBuf {
        self.staging_dir.join(format!("{}.zip.part", release.id))
    }

    /// A previously downloaded archive that still verifies, if any
    pub async fn existing(&self, release: &Release) -> Result<Option<DownloadArtifact>> {
        let path = self.artifact_path(release);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        match self.verify(release, &path).await {
            Ok(artifact) => Ok(Some(artifact)),
            Err(IngestError::Integrity(reason)) => {
                warn!(release = %release.id, %reason, "Staged archive no longer verifies, discarding");
                fs::remove_file(&path).await?;
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Download `release`, resuming any partial transfer left by an earlier attempt.
    ///
    /// Cancellation is observed between received chunks; the partial file is
    /// kept so the next attempt resumes where this one stopped.
    pub async fn download(&self, release: &Release, cancel: &CancellationToken) -> Result<DownloadArtifact> {
        fs::create_dir_all(&self.staging_dir).await?;

        if let Some(artifact) = self.existing(release).await? {
            info!(release = %release.id, "Reusing verified archive");
            return Ok(artifact);
        }

        let part = self.partial_path(release);
        let offset = match fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut request = self.client.get(&release.url);
        if offset > 0 {
            info!(release = %release.id, offset, "Resuming partial download");
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // Nothing left to send: the partial file already holds every byte.
            debug!(release = %release.id, "Server reports range complete");
        } else if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let start = content_range_start(&response);
            if start != Some(offset) {
                fs::remove_file(&part).await?;
                return Err(IngestError::TransientFetch(format!(
                    "{}: expected range starting at {}, got {:?}",
                    release.url, offset, start
                )));
            }
            self.stream_to_file(release, response, &part, true, offset, cancel).await?;
        } else if status.is_success() {
            // Full body: the server ignored or was not sent a range.
            self.stream_to_file(release, response, &part, false, 0, cancel).await?;
        } else if status.is_client_error()
            && !matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS)
        {
            return Err(IngestError::PermanentFetch(format!("{}: HTTP {}", release.url, status)));
        } else {
            return Err(IngestError::TransientFetch(format!("{}: HTTP {}", release.url, status)));
        }

        let artifact = match self.verify(release, &part).await {
            Ok(artifact) => artifact,
            Err(err @ IngestError::Integrity(_)) => {
                warn!(release = %release.id, error = %err, "Discarding staged file");
                fs::remove_file(&part).await?;
                return Err(err);
            },
            Err(err) => return Err(err),
        };

        let path = self.artifact_path(release);
        fs::rename(&part, &path).await?;
        info!(release = %release.id, bytes = artifact.size, "Download complete");

        Ok(DownloadArtifact { path, ..artifact })
    }

    /// Remove a downloaded archive after it has been loaded
    pub async fn discard(&self, artifact: &DownloadArtifact) -> Result<()> {
        match fs::remove_file(&artifact.path).await {
            Ok(()) => {
                debug!(release = %artifact.release_id, "Removed staged archive");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_to_file(
        &self,
        release: &Release,
        response: Response,
        part: &Path,
        append: bool,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expected_total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| len + offset);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part)
            .await?;

        let mut written = offset;
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    info!(release = %release.id, bytes = written, "Download cancelled, partial file kept");
                    return Err(IngestError::Cancelled);
                },
                next = body.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    return Err(IngestError::TransientFetch(format!(
                        "{}: transfer interrupted after {} bytes: {}",
                        release.url, written, e
                    )));
                },
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected_total {
            if written < expected {
                return Err(IngestError::TransientFetch(format!(
                    "{}: connection closed after {} of {} bytes",
                    release.url, written, expected
                )));
            }
        }
        Ok(())
    }

    /// Check the file at `path` against the release's published size and checksum
    async fn verify(&self, release: &Release, path: &Path) -> Result<DownloadArtifact> {
        let size = fs::metadata(path).await?.len();
        if let Some(expected) = release.size {
            if size != expected {
                return Err(IngestError::Integrity(format!(
                    "{}: expected {} bytes, found {}",
                    release.id, expected, size
                )));
            }
        }

        let algorithm = release
            .checksum
            .as_ref()
            .map_or(ChecksumAlgorithm::Sha256, |c| c.algorithm);
        let owned = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || Checksum::of_file(owned, algorithm)).await??;

        if let Some(expected) = &release.checksum {
            if actual != *expected {
                return Err(IngestError::Integrity(format!(
                    "{}: checksum mismatch, expected {}, got {}",
                    release.id, expected, actual
                )));
            }
        }

        Ok(DownloadArtifact {
            release_id: release.id.clone(),
            dataset: release.dataset,
            period: release.period,
            path: path.to_path_buf(),
            size,
            checksum: actual,
            complete: true,
        })
    }
}

/// Start offset from `Content-Range: bytes <start>-<end>/<total>`
fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn classify_request_error(err: reqwest::Error) -> IngestError {
    if err.is_builder() {
        IngestError::PermanentFetch(err.to_string())
    } else {
        IngestError::TransientFetch(err.to_string())
    }
}
