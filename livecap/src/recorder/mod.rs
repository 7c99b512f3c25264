//! Per-broadcast lifecycle state machine.
//!
//! A recorder waits for its broadcast to go live (adaptive heartbeat
//! back-off), supervises the downloader while recording (rotating it ahead
//! of the signed-URL expiry), drains it when the broadcast ends, and always
//! cleans up: tracking-table removal, a guaranteed kill, and exactly one
//! `post_download` per broadcast.

pub mod heartbeat;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::channel::ChannelWatcher;
use crate::downloader::{DownloadHandle, DownloadRequest, DownloaderFactory};
use crate::hooks::{LifecycleHooks, run_post_hook, run_started_hook};

pub use heartbeat::{HeartbeatOracle, HeartbeatStatus, LivenessOracle};

/// Watch-page URL for a video id.
fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

// Staleness budget of the pre-live back-off gate: how old the last oracle
// answer may be before another probe is due, by distance to the scheduled
// start.
const NEAR_WINDOW_SECS: i64 = 86_400;
const NEAR_STALE_BUDGET_SECS: i64 = 1_200;
const FAR_STALE_BUDGET_SECS: i64 = 12 * 3_600;

fn stale_budget(remaining: i64) -> i64 {
    if remaining < NEAR_WINDOW_SECS {
        NEAR_STALE_BUDGET_SECS
    } else {
        FAR_STALE_BUDGET_SECS
    }
}

/// Tunables of a broadcast recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Base tick of both lifecycle loops.
    pub heartbeat_interval: Duration,
    /// Distance to the scheduled start below which the back-off gate stops
    /// applying.
    pub upcoming_poll_start: Duration,
    /// Lifetime of a signed media URL; the downloader is rotated before it
    /// lapses.
    pub url_expire: Duration,
    /// How long a downloader may keep draining after the broadcast ends
    /// before it is interrupted.
    pub finish_grace: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            upcoming_poll_start: Duration::from_secs(300),
            url_expire: Duration::from_secs(6 * 3600),
            finish_grace: Duration::from_secs(45),
        }
    }
}

/// Broadcast lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Waiting,
    Recording,
    Finishing,
    Invalid,
}

impl BroadcastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Recording => "recording",
            Self::Finishing => "finishing",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a recorder needs at construction.
pub struct RecorderContext {
    pub video_id: String,
    pub title: String,
    pub download_root: PathBuf,
    pub config: RecorderConfig,
    pub oracle: Arc<dyn LivenessOracle>,
    pub downloader: Arc<dyn DownloaderFactory>,
    pub hooks: Arc<dyn LifecycleHooks>,
    /// Non-owning back-reference for `finish_tracking`.
    pub channel: Weak<ChannelWatcher>,
    pub shutdown: CancellationToken,
}

/// One tracked broadcast and its recording worker.
pub struct BroadcastRecorder {
    video_id: String,
    title: String,
    download_root: PathBuf,
    config: RecorderConfig,
    oracle: Arc<dyn LivenessOracle>,
    downloader: Arc<dyn DownloaderFactory>,
    hooks: Arc<dyn LifecycleHooks>,
    channel: Weak<ChannelWatcher>,
    state: Mutex<BroadcastState>,
    force_refresh: AtomicBool,
    scheduled_time: AtomicI64,
    last_poll: AtomicI64,
    finished: AtomicBool,
    shutdown: CancellationToken,
}

impl BroadcastRecorder {
    /// Create the recorder and start its worker.
    pub fn spawn(ctx: RecorderContext) -> Arc<Self> {
        info!(video_id = %ctx.video_id, title = %ctx.title, "Tracking video");
        let recorder = Arc::new(Self {
            video_id: ctx.video_id,
            title: ctx.title,
            download_root: ctx.download_root,
            config: ctx.config,
            oracle: ctx.oracle,
            downloader: ctx.downloader,
            hooks: ctx.hooks,
            channel: ctx.channel,
            state: Mutex::new(BroadcastState::Waiting),
            force_refresh: AtomicBool::new(true),
            scheduled_time: AtomicI64::new(0),
            last_poll: AtomicI64::new(0),
            finished: AtomicBool::new(false),
            shutdown: ctx.shutdown,
        });

        let worker = recorder.clone();
        tokio::spawn(async move { worker.run().await });
        recorder
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn state(&self) -> BroadcastState {
        *self.state.lock()
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Force the next pre-live tick to probe the oracle, bypassing the
    /// back-off gate. Called on re-discovery.
    pub fn mark_refresh(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    /// One status line for the report.
    pub fn status_line(&self) -> String {
        let state = self.state();
        let scheduled = self.scheduled_time.load(Ordering::SeqCst);
        match chrono::Local.timestamp_opt(scheduled, 0).single() {
            Some(at) if scheduled > 0 => {
                format!("Video {} [{}] scheduled at {}", self.video_id, state, at)
            }
            _ => format!("Video {} [{}]", self.video_id, state),
        }
    }

    async fn run(self: Arc<Self>) {
        let dir = self.download_root.join(&self.video_id);
        let mut handle: Option<DownloadHandle> = None;

        if let Err(e) = self.capture(&dir, &mut handle).await {
            error!(video_id = %self.video_id, "Failed to record broadcast: {}", e);
        }

        // Cleanup runs on every path out of the lifecycle.
        if let Some(channel) = self.channel.upgrade() {
            channel.finish_tracking(&self.video_id);
        }
        if let Some(handle) = handle.as_ref()
            && handle.is_running()
        {
            handle.kill();
        }
        run_post_hook(
            &self.hooks,
            &self.video_id,
            &dir,
            self.finished.load(Ordering::SeqCst),
        );
        *self.state.lock() = BroadcastState::Invalid;
    }

    async fn capture(&self, dir: &Path, handle_slot: &mut Option<DownloadHandle>) -> crate::Result<()> {
        if !self.wait_for_live().await {
            return Ok(());
        }

        // Recording: one downloader per signed-URL lifetime.
        tokio::fs::create_dir_all(dir).await?;
        info!(video_id = %self.video_id, "Start downloading");
        let url = video_url(&self.video_id);
        let first = self
            .downloader
            .start(DownloadRequest::new(&url, dir).with_filename(&self.video_id))
            .await?;
        *handle_slot = Some(first);
        *self.state.lock() = BroadcastState::Recording;
        run_started_hook(&self.hooks, &self.video_id, dir);

        let mut dl_expire = Instant::now() + self.config.url_expire;
        while handle_slot.as_ref().is_some_and(DownloadHandle::is_running) {
            if Instant::now() + self.config.heartbeat_interval >= dl_expire {
                let rotated_name = format!("{}.{}", self.video_id, Utc::now().timestamp());
                match self
                    .downloader
                    .start(DownloadRequest::new(&url, dir).with_filename(rotated_name))
                    .await
                {
                    Ok(replacement) => {
                        info!(video_id = %self.video_id, "Rotating downloader before URL expiry");
                        // The predecessor is interrupted only once its
                        // successor is running.
                        if let Some(old) = handle_slot.replace(replacement) {
                            old.interrupt();
                        }
                        dl_expire = Instant::now() + self.config.url_expire;
                    }
                    Err(e) => {
                        error!(video_id = %self.video_id, "Failed to rotate downloader: {}", e)
                    }
                }
            }

            if !self.idle_tick().await {
                break;
            }

            match self.oracle.check(&self.video_id).await {
                Ok(HeartbeatStatus::Offline {
                    display_endscreen: true,
                    ..
                }) => break,
                Ok(_) => {}
                Err(e) => error!(video_id = %self.video_id, "Failed checking video status: {}", e),
            }
        }

        // Finishing: let the downloader drain, then insist.
        *self.state.lock() = BroadcastState::Finishing;
        if let Some(handle) = handle_slot.as_ref() {
            info!(video_id = %self.video_id, "Waiting for downloader to finish");
            if !handle.wait(Some(self.config.finish_grace)).await {
                info!(video_id = %self.video_id, "Interrupting downloader");
                handle.interrupt();
                handle.wait(None).await;
            }
            if handle.finished() {
                info!(video_id = %self.video_id, "Finished downloading");
                self.finished.store(true, Ordering::SeqCst);
            } else {
                error!(video_id = %self.video_id, "Downloader did not finish cleanly");
            }
        }
        Ok(())
    }

    /// Pre-live wait. Returns whether the broadcast went live (as opposed
    /// to reaching a terminal pre-live verdict or shutdown).
    async fn wait_for_live(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }

            let now = Utc::now().timestamp();
            let scheduled = self.scheduled_time.load(Ordering::SeqCst);
            let remaining = scheduled - now;

            // Back-off gate: far from the scheduled start, a recent oracle
            // answer is still considered fresh.
            if !self.force_refresh.load(Ordering::SeqCst)
                && remaining > self.config.upcoming_poll_start.as_secs() as i64
                && now - self.last_poll.load(Ordering::SeqCst) < stale_budget(remaining)
            {
                if !self.idle_tick().await {
                    return false;
                }
                continue;
            }

            self.force_refresh.store(false, Ordering::SeqCst);
            self.last_poll.store(now, Ordering::SeqCst);

            match self.oracle.check(&self.video_id).await {
                Ok(HeartbeatStatus::Offline {
                    display_endscreen: true,
                    ..
                }) => {
                    info!(video_id = %self.video_id, "Old recorded live video");
                    return false;
                }
                Ok(HeartbeatStatus::Offline {
                    scheduled_start, ..
                }) => {
                    if let Some(at) = scheduled_start
                        && at != scheduled
                    {
                        self.scheduled_time.store(at, Ordering::SeqCst);
                        match chrono::Local.timestamp_opt(at, 0).single() {
                            Some(local) => {
                                info!(video_id = %self.video_id, "Video scheduled at {}", local)
                            }
                            None => info!(video_id = %self.video_id, "Video scheduled at {}", at),
                        }
                    }
                }
                Ok(HeartbeatStatus::Live) => return true,
                Ok(HeartbeatStatus::NotLive) => {
                    info!(video_id = %self.video_id, "Uploaded video, not a live stream");
                    return false;
                }
                Ok(HeartbeatStatus::Unplayable) => {
                    info!(video_id = %self.video_id, "Broadcast canceled");
                    return false;
                }
                Ok(HeartbeatStatus::Unknown(status)) => {
                    error!(video_id = %self.video_id, "Unknown status: {}", status);
                    return false;
                }
                Ok(HeartbeatStatus::ServerError(message)) => {
                    error!(video_id = %self.video_id, "Server error: {}", message);
                    return false;
                }
                Err(e) => {
                    error!(video_id = %self.video_id, "Failed checking video status: {}", e)
                }
            }

            if !self.idle_tick().await {
                return false;
            }
        }
    }

    /// Sleep one heartbeat interval; false when shutdown fired instead.
    async fn idle_tick(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.heartbeat_interval) => true,
        }
    }
}
