//! Alternative extractor backend.
//!
//! Captures the extractor's metadata output into a `.info.json` sidecar,
//! then runs the media download. Success requires a zero exit code and the
//! expected media file in the target directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::process::{log_stderr, supervise};
use super::{DownloadHandle, DownloadRequest, DownloaderFactory, DownloaderKind};
use crate::Result;

/// Configuration for the alternative extractor backend.
#[derive(Debug, Clone)]
pub struct YougetConfig {
    /// Extractor binary.
    pub binary_path: String,
    /// Extra arguments appended before the URL.
    pub extra_args: Vec<String>,
    /// Grace period between interrupt and kill.
    pub grace_period: Duration,
    /// Deadline for the metadata sidecar fetch.
    pub info_timeout: Duration,
}

impl Default for YougetConfig {
    fn default() -> Self {
        Self {
            binary_path: "you-get".to_string(),
            extra_args: Vec::new(),
            grace_period: Duration::from_secs(15),
            info_timeout: Duration::from_secs(30),
        }
    }
}

/// Alternative extractor backend.
pub struct YougetDownloader {
    config: YougetConfig,
}

impl YougetDownloader {
    pub fn new() -> Self {
        Self::with_config(YougetConfig::default())
    }

    pub fn with_config(config: YougetConfig) -> Self {
        Self { config }
    }

    /// Write `<name>.info.json` from the extractor's `--json` output.
    /// Best effort: failures are logged and the download proceeds.
    async fn write_info_sidecar(&self, url: &str, dir: &Path, name: &str) {
        let run = async {
            let output = Command::new(&self.config.binary_path)
                .arg("--json")
                .arg(url)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                return Err(crate::Error::Download(format!(
                    "metadata fetch exited with {}",
                    output.status
                )));
            }
            let path = dir.join(format!("{}.info.json", name));
            info!(path = %path.display(), "Writing extractor metadata");
            tokio::fs::write(&path, &output.stdout).await?;
            Ok::<_, crate::Error>(())
        };

        match tokio::time::timeout(self.config.info_timeout, run).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(url, "Metadata sidecar failed: {}", e),
            Err(_) => warn!(url, "Metadata sidecar timed out"),
        }
    }
}

impl Default for YougetDownloader {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the directory contains the media artifact for `name`.
fn media_artifact_present(dir: &PathBuf, name: &str) -> bool {
    let prefix = format!("{}.", name);
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                file_name.starts_with(&prefix) && !file_name.ends_with(".info.json")
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl DownloaderFactory for YougetDownloader {
    async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        tokio::fs::create_dir_all(&request.dir).await?;

        let name = request
            .filename
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());

        self.write_info_sidecar(&request.url, &request.dir, &name)
            .await;

        info!(url = %request.url, dir = %request.dir.display(), "Downloading with the alternative extractor");

        let mut child = Command::new(&self.config.binary_path)
            .arg("-o")
            .arg(&request.dir)
            .arg("-O")
            .arg(&name)
            .arg("--no-caption")
            .args(&self.config.extra_args)
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
            log_stderr("youget", stderr);
        }

        let artifact_dir = request.dir.clone();
        let artifact_name = name.clone();
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Youget);
        supervise(
            child,
            driver,
            self.config.grace_period,
            Some(Box::new(move || {
                media_artifact_present(&artifact_dir, &artifact_name)
            })),
        );
        Ok(handle)
    }
}
