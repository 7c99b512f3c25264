//! Generic extractor backend.
//!
//! Spawns the general-purpose extractor against the URL; it writes an info
//! JSON sidecar and the media file named by video id (or the caller's
//! filename) into the target directory.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::process::{log_stderr, supervise};
use super::{DownloadHandle, DownloadRequest, DownloaderFactory, DownloaderKind};
use crate::Result;

/// Configuration for the generic extractor backend.
#[derive(Debug, Clone)]
pub struct YtdlpConfig {
    /// Extractor binary.
    pub binary_path: String,
    /// Extra arguments appended before the URL.
    pub extra_args: Vec<String>,
    /// Grace period between interrupt and kill.
    pub grace_period: Duration,
}

impl Default for YtdlpConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            extra_args: Vec::new(),
            grace_period: Duration::from_secs(15),
        }
    }
}

/// Generic extractor backend.
pub struct YtdlpDownloader {
    config: YtdlpConfig,
}

impl YtdlpDownloader {
    pub fn new() -> Self {
        Self::with_config(YtdlpConfig::default())
    }

    pub fn with_config(config: YtdlpConfig) -> Self {
        Self { config }
    }
}

impl Default for YtdlpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloaderFactory for YtdlpDownloader {
    async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        tokio::fs::create_dir_all(&request.dir).await?;

        let base = request
            .filename
            .clone()
            .unwrap_or_else(|| "%(id)s".to_string());
        let template = request.dir.join(format!("{}.%(ext)s", base));

        info!(url = %request.url, dir = %request.dir.display(), "Downloading with the generic extractor");

        let mut child = Command::new(&self.config.binary_path)
            .arg("--write-info-json")
            .arg("--no-progress")
            .args(&self.config.extra_args)
            .arg("-o")
            .arg(&template)
            .arg(&request.url)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                crate::Error::Download(format!(
                    "Failed to spawn {}: {}",
                    self.config.binary_path, e
                ))
            })?;

        if let Some(stderr) = child.stderr.take() {
            log_stderr("ytdlp", stderr);
        }

        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(child, driver, self.config.grace_period, None);
        Ok(handle)
    }
}
