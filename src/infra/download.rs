//! HTTP download functionality
//!
//! Streams files to disk with progress reporting, resumes partial downloads
//! with HTTP range requests, and retries transient failures with exponential
//! backoff. Partial files are left in place on failure so the next attempt
//! can continue where this one stopped.

use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::error::DownloadError;

/// Progress callback type for download progress reporting
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Download result containing file path and metadata
#[derive(Debug)]
pub struct DownloadResult {
    /// Path to the downloaded file
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Whether the transfer continued an existing partial file
    pub resumed: bool,
}

impl DownloadError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError { .. } => true,
            Self::HttpStatus { status, .. } => {
                *status >= 500 || matches!(*status, 408 | 416 | 429)
            }
            Self::IoError { .. } | Self::Cancelled { .. } => false,
        }
    }
}

/// Download manager for fetching files with retry and resume support
#[derive(Debug, Clone)]
pub struct DownloadManager {
    /// HTTP client
    client: reqwest::Client,
    /// Maximum attempts per request
    max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    base_delay_ms: u64,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new() -> Self {
        Self::with_config(
            defaults::MAX_DOWNLOAD_RETRIES,
            defaults::DOWNLOAD_BASE_DELAY_MS,
            defaults::CONNECT_TIMEOUT_SECS,
        )
    }

    /// Create a download manager with custom settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64, connect_timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(connect_timeout_secs))
                .read_timeout(Duration::from_secs(defaults::READ_TIMEOUT_SECS))
                .user_agent(concat!("weirding/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries: max_retries.max(1),
            base_delay_ms,
        }
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Download `url` into `dest`, continuing any partial content already there
    ///
    /// When `dest` exists a `Range` request asks for the remaining bytes. A
    /// `206` reply is appended; a `200` reply means the server ignored the
    /// range and the file is rewritten from the start. Cancellation is
    /// observed between chunks and keeps the partial file.
    pub async fn download_resumable(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        self.retrying(url, move || self.download_once(url, dest, cancel, progress))
            .await
    }

    /// Fetch and deserialize a JSON document
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DownloadError> {
        let body = self.fetch_text(url).await?;
        serde_json::from_str(&body).map_err(|e| DownloadError::NetworkError {
            url: url.to_string(),
            error: format!("invalid JSON: {e}"),
        })
    }

    /// Fetch a small text document (directory listings, checksum files)
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        self.retrying(url, move || async move {
            let response = self.client.get(url).send().await.map_err(|e| {
                DownloadError::NetworkError {
                    url: url.to_string(),
                    error: e.to_string(),
                }
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            response
                .text()
                .await
                .map_err(|e| DownloadError::NetworkError {
                    url: url.to_string(),
                    error: e.to_string(),
                })
        })
        .await
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts
    async fn retrying<T, F, Fut>(&self, url: &str, mut operation: F) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();
        let max = self.max_retries;
        let mut attempt = 0u32;

        backoff::future::retry(policy, || {
            attempt += 1;
            let current = attempt;
            let pending = operation();
            async move {
                pending.await.map_err(|e| {
                    if current < max && e.is_transient() {
                        tracing::warn!(url, attempt = current, error = %e, "Retrying download");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    /// Single download attempt without retry
    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let io_err = |e: std::io::Error| DownloadError::IoError {
            path: dest.to_path_buf(),
            error: e.to_string(),
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled {
                url: url.to_string(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::IoError {
                    path: parent.to_path_buf(),
                    error: e.to_string(),
                })?;
        }

        let existing = tokio::fs::metadata(dest).await.map_or(0, |m| m.len());
        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Partial file is stale or already complete; start over next time
            let _ = tokio::fs::remove_file(dest).await;
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        let (mut file, mut downloaded) = if resumed {
            tracing::info!(url, offset = existing, "Resuming download");
            let file = OpenOptions::new()
                .append(true)
                .open(dest)
                .await
                .map_err(io_err)?;
            (file, existing)
        } else {
            (File::create(dest).await.map_err(io_err)?, 0)
        };

        let total_size = response.content_length().map_or(0, |len| len + downloaded);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    file.flush().await.map_err(io_err)?;
                    return Err(DownloadError::Cancelled { url: url.to_string() });
                }
                next = stream.next() => next,
            };
            let Some(chunk_result) = next else { break };
            let chunk = chunk_result.map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

            file.write_all(&chunk).await.map_err(io_err)?;
            downloaded += chunk.len() as u64;

            if let Some(cb) = progress {
                cb(downloaded, total_size);
            }
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            size: downloaded,
            resumed,
        })
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}
