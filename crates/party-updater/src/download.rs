//! Streaming asset download to a file.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderValue, USER_AGENT};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, UpdateError};
use crate::github::USER_AGENT_VALUE;

/// Budget for one asset download, body included.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Download progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes, when the server announced a length.
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Returns the progress as a fraction (0.0 to 1.0), if the total is known.
    #[must_use]
    pub fn fraction(&self) -> Option<f32> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded as f64 / total as f64).min(1.0) as f32),
        }
    }

    /// Returns the progress as a percentage (0 to 100), if the total is known.
    #[must_use]
    pub fn percentage(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0) as u8)
    }
}

/// Fetches a release asset into a local file.
pub trait AssetFetcher: Send + Sync {
    /// Downloads `url` into `dest`, creating or truncating it.
    ///
    /// Returns the number of bytes written.
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> impl Future<Output = Result<u64>> + Send;
}

impl<T: AssetFetcher> AssetFetcher for std::sync::Arc<T> {
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> impl Future<Output = Result<u64>> + Send {
        (**self).fetch_to(url, dest, progress)
    }
}

/// HTTP implementation of [`AssetFetcher`].
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Creates a downloader with the fixed download budget.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| UpdateError::DownloadFailed(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl AssetFetcher for HttpDownloader {
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64> {
        tracing::info!("Starting download from {}", url);

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE))
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed(describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed(format!(
                "download failed with status {status}"
            )));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| UpdateError::from_write(&e, dest))?;
        let mut downloaded = 0u64;
        progress(DownloadProgress { downloaded, total });

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::DownloadFailed(describe(&e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::from_write(&e, dest))?;
            downloaded += chunk.len() as u64;
            progress(DownloadProgress { downloaded, total });
        }
        file.flush()
            .await
            .map_err(|e| UpdateError::from_write(&e, dest))?;
        file.sync_all()
            .await
            .map_err(|e| UpdateError::from_write(&e, dest))?;

        if let Some(expected) = total.filter(|&t| t != downloaded) {
            return Err(UpdateError::DownloadFailed(format!(
                "truncated download: {downloaded} of {expected} bytes"
            )));
        }

        tracing::info!("Download complete: {}", format_bytes(downloaded));
        Ok(downloaded)
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out after {}s", DOWNLOAD_TIMEOUT.as_secs())
    } else {
        err.to_string()
    }
}

/// Format bytes as a human-readable string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
