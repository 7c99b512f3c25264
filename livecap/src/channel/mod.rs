//! Per-channel watcher.
//!
//! A channel watcher discovers broadcasts through push notifications
//! and/or periodic polling of the channel listing, and keeps the tracking
//! table of active broadcast recorders: at most one per video id,
//! re-discovery marks the existing entry for a forced refresh.

pub mod listing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::downloader::DownloaderFactory;
use crate::hooks::LifecycleHooks;
use crate::ingress::PushIngress;
use crate::recorder::heartbeat::{CLIENT_NAME_HEADER, CLIENT_VERSION};
use crate::recorder::{BroadcastRecorder, LivenessOracle, RecorderConfig, RecorderContext};
use crate::status::{StatusNode, StatusSource};

pub use listing::VideoEntry;

/// Source of channel sidebar data.
#[async_trait]
pub trait ChannelListing: Send + Sync {
    async fn fetch(&self, channel_id: &str) -> Result<Value>;
}

/// HTTP implementation against the channel data endpoint.
pub struct YoutubeChannelListing {
    client: reqwest::Client,
}

impl YoutubeChannelListing {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelListing for YoutubeChannelListing {
    async fn fetch(&self, channel_id: &str) -> Result<Value> {
        let url = format!("https://www.youtube.com/channel/{}?pbj=1", channel_id);
        Ok(self
            .client
            .get(&url)
            .header(CLIENT_NAME_HEADER.0, CLIENT_NAME_HEADER.1)
            .header("x-youtube-client-version", CLIENT_VERSION)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Static description of a tracked channel.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub channel_id: String,
    pub download_root: PathBuf,
    /// Only broadcasts whose title matches are recorded.
    pub title_filter: Option<String>,
    /// When set, a polling loop runs at this cadence in addition to (or
    /// instead of) the push ingress.
    pub poll_interval: Option<Duration>,
    /// Bound on how far ahead a scheduled broadcast may start to be
    /// tracked; `None` tracks anything scheduled.
    pub upcoming_window: Option<Duration>,
    pub recorder: RecorderConfig,
}

impl ChannelTarget {
    pub fn new(channel_id: impl Into<String>, download_root: impl Into<PathBuf>) -> Self {
        Self {
            channel_id: channel_id.into(),
            download_root: download_root.into(),
            title_filter: None,
            poll_interval: None,
            upcoming_window: None,
            recorder: RecorderConfig::default(),
        }
    }
}

/// Shared collaborators handed to every channel watcher.
pub struct ChannelContext {
    pub listing: Arc<dyn ChannelListing>,
    pub oracle: Arc<dyn LivenessOracle>,
    pub downloader: Arc<dyn DownloaderFactory>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub shutdown: CancellationToken,
}

/// Watcher of one channel and owner of its broadcast recorders.
pub struct ChannelWatcher {
    target: ChannelTarget,
    title_filter: Option<Regex>,
    listing: Arc<dyn ChannelListing>,
    oracle: Arc<dyn LivenessOracle>,
    downloader: Arc<dyn DownloaderFactory>,
    hooks: Arc<dyn LifecycleHooks>,
    tracking: Mutex<HashMap<String, Arc<BroadcastRecorder>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ChannelWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWatcher")
            .field("target", &self.target)
            .field("title_filter", &self.title_filter)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl ChannelWatcher {
    /// Build the watcher, subscribe it, run the initial poll and start the
    /// polling loop if configured.
    ///
    /// The initial poll's outcome is logged but never fails construction.
    pub async fn start(
        target: ChannelTarget,
        ctx: ChannelContext,
        ingress: Option<&Arc<PushIngress>>,
    ) -> Result<Arc<Self>> {
        if target.poll_interval.is_none() && ingress.is_none() {
            return Err(crate::Error::config(format!(
                "channel {} needs a push ingress or a poll interval",
                target.channel_id
            )));
        }

        let title_filter = target
            .title_filter
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        let watcher = Arc::new(Self {
            title_filter,
            listing: ctx.listing,
            oracle: ctx.oracle,
            downloader: ctx.downloader,
            hooks: ctx.hooks,
            tracking: Mutex::new(HashMap::new()),
            shutdown: ctx.shutdown.child_token(),
            target,
        });

        if let Some(ingress) = ingress {
            info!(channel_id = %watcher.target.channel_id, "Monitoring channel via push ingress");
            ingress.subscribe(&watcher.target.channel_id, &watcher).await?;
        }
        if let Some(interval) = watcher.target.poll_interval {
            info!(channel_id = %watcher.target.channel_id, "Monitoring channel via polling");
            tokio::spawn(run_poll(watcher.clone(), interval));
        }

        if let Err(e) = watcher.poll().await {
            error!(channel_id = %watcher.target.channel_id, "Polling error: {}", e);
        }
        Ok(watcher)
    }

    pub fn channel_id(&self) -> &str {
        &self.target.channel_id
    }

    /// Number of currently tracked broadcasts.
    pub fn tracking_count(&self) -> usize {
        self.tracking.lock().len()
    }

    /// Track a discovered broadcast.
    ///
    /// An already-tracked id only gets its recorder marked for a forced
    /// refresh; a new id passes the title filter before a recorder is
    /// created.
    pub fn watch_video(self: &Arc<Self>, video_id: &str, title: &str) {
        let mut tracking = self.tracking.lock();
        if let Some(existing) = tracking.get(video_id) {
            existing.mark_refresh();
            return;
        }
        if let Some(filter) = &self.title_filter
            && !filter.is_match(title)
        {
            debug!(video_id, title, "Title filtered out");
            return;
        }

        let recorder = BroadcastRecorder::spawn(RecorderContext {
            video_id: video_id.to_string(),
            title: title.to_string(),
            download_root: self.target.download_root.clone(),
            config: self.target.recorder.clone(),
            oracle: self.oracle.clone(),
            downloader: self.downloader.clone(),
            hooks: self.hooks.clone(),
            channel: Arc::downgrade(self),
            shutdown: self.shutdown.child_token(),
        });
        tracking.insert(video_id.to_string(), recorder);
    }

    /// Drop a broadcast from the tracking table.
    pub fn finish_tracking(&self, video_id: &str) {
        if self.tracking.lock().remove(video_id).is_some() {
            debug!(video_id, "Stopped tracking video");
        }
    }

    /// Fetch the channel listing and track every live or upcoming entry
    /// not yet in the table.
    pub async fn poll(self: &Arc<Self>) -> Result<()> {
        debug!(channel_id = %self.target.channel_id, "Polling channel");
        let data = self.listing.fetch(&self.target.channel_id).await?;
        let now = Utc::now().timestamp();
        let candidates =
            listing::collect_live_candidates(&data, now, self.target.upcoming_window);

        for entry in candidates {
            if self.tracking.lock().contains_key(&entry.video_id) {
                continue;
            }
            info!(
                channel_id = %self.target.channel_id,
                video_id = %entry.video_id,
                title = %entry.title,
                "Polling found broadcast"
            );
            self.watch_video(&entry.video_id, &entry.title);
        }
        Ok(())
    }
}

impl StatusSource for ChannelWatcher {
    fn status(&self) -> Vec<StatusNode> {
        let tracking = self.tracking.lock();
        let mut lines: Vec<_> = tracking.values().map(|r| r.status_line()).collect();
        lines.sort();
        vec![
            StatusNode::line(format!(
                "Channel {} ({} tracking)",
                self.target.channel_id,
                tracking.len()
            )),
            StatusNode::Group(lines.into_iter().map(StatusNode::Line).collect()),
        ]
    }
}

async fn run_poll(watcher: Arc<ChannelWatcher>, interval: Duration) {
    loop {
        tokio::select! {
            _ = watcher.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = watcher.poll().await {
            error!(channel_id = %watcher.target.channel_id, "Polling error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::downloader::testing::MockFactory;
    use crate::hooks::NoopHooks;
    use crate::recorder::HeartbeatStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Listing that returns a fixed payload.
    struct FixedListing {
        payload: Value,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ChannelListing for FixedListing {
        async fn fetch(&self, _channel_id: &str) -> Result<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
    }

    /// Oracle that keeps every broadcast waiting forever.
    struct WaitingOracle;

    #[async_trait]
    impl LivenessOracle for WaitingOracle {
        async fn check(&self, _video_id: &str) -> Result<HeartbeatStatus> {
            Ok(HeartbeatStatus::Offline {
                display_endscreen: false,
                scheduled_start: Some(Utc::now().timestamp() + 3600),
            })
        }
    }

    fn waiting_context(listing: Arc<FixedListing>) -> ChannelContext {
        ChannelContext {
            listing,
            oracle: Arc::new(WaitingOracle),
            downloader: MockFactory::new(),
            hooks: Arc::new(NoopHooks),
            shutdown: CancellationToken::new(),
        }
    }

    fn live_entry(video_id: &str, title: &str) -> Value {
        json!({
            "videoId": video_id,
            "title": {"simpleText": title},
            "badges": [{"metadataBadgeRenderer": {"style": "BADGE_STYLE_TYPE_LIVE_NOW"}}]
        })
    }

    fn target(tmp: &tempfile::TempDir) -> ChannelTarget {
        let mut target = ChannelTarget::new("UC1", tmp.path());
        target.poll_interval = Some(Duration::from_secs(3600));
        target.recorder.heartbeat_interval = Duration::from_millis(20);
        target
    }

    #[tokio::test]
    async fn initial_poll_tracks_discovered_broadcasts() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing {
            payload: json!({"contents": [live_entry("v1", "One"), live_entry("v2", "Two")]}),
            fetches: AtomicUsize::new(0),
        });
        let watcher = ChannelWatcher::start(target(&tmp), waiting_context(listing.clone()), None)
            .await
            .unwrap();

        assert_eq!(listing.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.tracking_count(), 2);
    }

    #[tokio::test]
    async fn listing_error_is_swallowed_at_startup() {
        struct FailingListing;

        #[async_trait]
        impl ChannelListing for FailingListing {
            async fn fetch(&self, _channel_id: &str) -> Result<Value> {
                Err(crate::Error::monitor("listing unavailable"))
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let ctx = ChannelContext {
            listing: Arc::new(FailingListing),
            oracle: Arc::new(WaitingOracle),
            downloader: MockFactory::new(),
            hooks: Arc::new(NoopHooks),
            shutdown: CancellationToken::new(),
        };
        let watcher = ChannelWatcher::start(target(&tmp), ctx, None).await.unwrap();
        assert_eq!(watcher.tracking_count(), 0);
    }

    #[tokio::test]
    async fn watcher_requires_a_discovery_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing {
            payload: json!({}),
            fetches: AtomicUsize::new(0),
        });
        let mut no_poll = target(&tmp);
        no_poll.poll_interval = None;

        let err = ChannelWatcher::start(no_poll, waiting_context(listing), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Configuration(_)));
    }

    #[tokio::test]
    async fn rediscovery_keeps_one_recorder_per_video_id() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing {
            payload: json!({}),
            fetches: AtomicUsize::new(0),
        });
        let watcher = ChannelWatcher::start(target(&tmp), waiting_context(listing), None)
            .await
            .unwrap();

        watcher.watch_video("v42", "Stream");
        watcher.watch_video("v42", "Stream");
        watcher.watch_video("v42", "Renamed Stream");
        assert_eq!(watcher.tracking_count(), 1);
    }

    #[tokio::test]
    async fn title_filter_gates_new_broadcasts() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing {
            payload: json!({}),
            fetches: AtomicUsize::new(0),
        });
        let mut filtered = target(&tmp);
        filtered.title_filter = Some(r"^\[Live\]".to_string());
        let watcher = ChannelWatcher::start(filtered, waiting_context(listing), None)
            .await
            .unwrap();

        watcher.watch_video("plain", "plain");
        assert_eq!(watcher.tracking_count(), 0);

        watcher.watch_video("live", "[Live] X");
        assert_eq!(watcher.tracking_count(), 1);
    }

    #[tokio::test]
    async fn finish_tracking_removes_the_given_id() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing {
            payload: json!({}),
            fetches: AtomicUsize::new(0),
        });
        let watcher = ChannelWatcher::start(target(&tmp), waiting_context(listing), None)
            .await
            .unwrap();

        watcher.watch_video("a", "A");
        watcher.watch_video("b", "B");
        watcher.finish_tracking("a");
        assert_eq!(watcher.tracking_count(), 1);
        // Unknown ids are a no-op.
        watcher.finish_tracking("a");
        assert_eq!(watcher.tracking_count(), 1);
    }
}
