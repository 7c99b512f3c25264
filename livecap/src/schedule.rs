//! Scheduled URL capture.
//!
//! For sources with a known broadcast schedule instead of a liveness
//! signal: at every schedule occurrence a downloader records the URL into
//! a timestamped directory for the configured duration. A downloader that
//! dies early is restarted while the window is open; stopping at the
//! planned end of the window counts as a finished recording.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::downloader::{DownloadHandle, DownloadRequest, DownloaderFactory};
use crate::hooks::{LifecycleHooks, run_post_hook, run_started_hook};
use crate::status::{StatusNode, StatusSource};

/// Static description of a scheduled URL capture.
#[derive(Debug, Clone)]
pub struct UrlTarget {
    pub url: String,
    pub download_root: PathBuf,
    /// Seconds-resolution cron expression of the broadcast schedule.
    pub schedule: String,
    /// Length of each recording window.
    pub duration: Duration,
    /// Tick of the pre-start wait loop.
    pub scheduler_interval: Duration,
}

impl UrlTarget {
    pub fn new(
        url: impl Into<String>,
        download_root: impl Into<PathBuf>,
        schedule: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            download_root: download_root.into(),
            schedule: schedule.into(),
            duration,
            scheduler_interval: Duration::from_secs(15),
        }
    }
}

/// Shared collaborators handed to every URL watcher.
pub struct UrlContext {
    pub downloader: Arc<dyn DownloaderFactory>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub shutdown: CancellationToken,
}

/// Watcher of one scheduled URL.
pub struct UrlStreamWatcher {
    target: UrlTarget,
    schedule: Schedule,
    downloader: Arc<dyn DownloaderFactory>,
    hooks: Arc<dyn LifecycleHooks>,
    next_run: Mutex<Option<DateTime<Local>>>,
    recording: Mutex<bool>,
    shutdown: CancellationToken,
}

impl UrlStreamWatcher {
    /// Create the watcher and start its schedule loop.
    pub fn spawn(target: UrlTarget, ctx: UrlContext) -> Result<Arc<Self>> {
        let schedule = Schedule::from_str(&target.schedule).map_err(|e| {
            crate::Error::config(format!("invalid schedule '{}': {}", target.schedule, e))
        })?;
        info!(url = %target.url, "Monitoring scheduled URL");

        let watcher = Arc::new(Self {
            schedule,
            downloader: ctx.downloader,
            hooks: ctx.hooks,
            next_run: Mutex::new(None),
            recording: Mutex::new(false),
            shutdown: ctx.shutdown.child_token(),
            target,
        });
        tokio::spawn(run(watcher.clone()));
        Ok(watcher)
    }

    pub fn url(&self) -> &str {
        &self.target.url
    }

    /// Sleep until the occurrence starts; false when shutdown fired first.
    async fn wait_for_start(&self, at: DateTime<Local>) -> bool {
        loop {
            let remaining = match (at - Local::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => return true,
            };
            let tick = remaining.min(self.target.scheduler_interval);
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Record one schedule occurrence.
    async fn capture_window(&self, at: DateTime<Local>) -> Result<()> {
        if !self.wait_for_start(at).await {
            return Ok(());
        }
        info!(url = %self.target.url, "URL stream window opened");

        let dir = self
            .target
            .download_root
            .join(at.format("%Y%m%d_%H%M%S_%z").to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let deadline = at + chrono::Duration::from_std(self.target.duration).unwrap_or_default();
        let mut handle: Option<DownloadHandle> = None;
        let mut finished = false;

        let outcome: Result<()> = async {
            loop {
                let window_left = match (deadline - Local::now()).to_std() {
                    Ok(left) if !left.is_zero() => left,
                    _ => break,
                };
                if self.shutdown.is_cancelled() {
                    break;
                }

                let started_first = handle.is_none();
                let new_handle = self
                    .downloader
                    .start(DownloadRequest::new(&self.target.url, &dir))
                    .await?;
                *self.recording.lock() = true;
                if started_first {
                    run_started_hook(&self.hooks, &self.target.url, &dir);
                }

                if !new_handle.wait(Some(window_left)).await {
                    // Planned end of the window.
                    info!(url = %self.target.url, "Stopping downloader");
                    new_handle.interrupt();
                    new_handle.wait(None).await;
                    finished = true;
                    handle = Some(new_handle);
                    break;
                }
                warn!(url = %self.target.url, "Downloader aborted, restarting within window");
                handle = Some(new_handle);
            }
            Ok(())
        }
        .await;

        if let Some(handle) = handle.as_ref() {
            handle.kill();
            run_post_hook(&self.hooks, &self.target.url, &dir, finished);
        }
        *self.recording.lock() = false;
        outcome
    }
}

impl StatusSource for UrlStreamWatcher {
    fn status(&self) -> Vec<StatusNode> {
        let next_run = self.next_run.lock();
        let scheduled = match next_run.as_ref() {
            Some(at) => format!(" scheduled at {}", at),
            None => String::new(),
        };
        let state = if *self.recording.lock() {
            "[recording]"
        } else {
            "[idle]"
        };
        vec![StatusNode::line(format!(
            "URL stream {}{} {}",
            self.target.url, scheduled, state
        ))]
    }
}

async fn run(watcher: Arc<UrlStreamWatcher>) {
    // `upcoming` yields occurrences from now on; recompute after each
    // window so overlapping occurrences collapse into the next future one.
    loop {
        if watcher.shutdown.is_cancelled() {
            return;
        }
        let Some(next) = watcher.schedule.upcoming(Local).next() else {
            info!(url = %watcher.target.url, "Schedule exhausted");
            return;
        };
        *watcher.next_run.lock() = Some(next);
        if let Err(e) = watcher.capture_window(next).await {
            error!(url = %watcher.target.url, "URL capture error: {}", e);
        }
        *watcher.next_run.lock() = None;
    }
}
