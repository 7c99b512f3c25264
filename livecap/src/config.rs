//! Application configuration.
//!
//! A JSON config file describes the ingress, the targets, the downloader
//! backend and the command hooks; every tunable has a default. The file
//! path comes from `LIVECAP_CONFIG` (default `livecap.json`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::Result;
use crate::channel::ChannelTarget;
use crate::downloader::{
    DownloaderFactory, PullerConfig, StreamPuller, YougetConfig, YougetDownloader, YtdlpConfig,
    YtdlpDownloader,
};
use crate::hooks::CommandHooks;
use crate::ingress::IngressConfig;
use crate::recorder::RecorderConfig;
use crate::room::RoomTarget;
use crate::schedule::UrlTarget;

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_http_timeout_secs() -> u64 {
    30
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub ingress: Option<IngressSettings>,
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
    #[serde(default)]
    pub rooms: Vec<RoomSettings>,
    #[serde(default)]
    pub urls: Vec<UrlSettings>,
    #[serde(default)]
    pub downloader: DownloaderSettings,
    #[serde(default)]
    pub hooks: CommandHooks,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            status_interval_secs: default_status_interval_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            ingress: None,
            channels: Vec::new(),
            rooms: Vec::new(),
            urls: Vec::new(),
            downloader: DownloaderSettings::default(),
            hooks: CommandHooks::default(),
        }
    }
}

impl AppConfig {
    /// Parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Parse a config file, falling back to defaults when it is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:18001".parse().expect("static bind address")
}

fn default_hub_url() -> String {
    "https://pubsubhubbub.appspot.com".to_string()
}

fn default_lease_seconds() -> u64 {
    432_000
}

fn default_renew_interval_secs() -> u64 {
    86_400
}

fn default_renew_spacing_secs() -> u64 {
    5
}

/// Push ingress settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Externally reachable callback URL registered with the hub.
    pub callback_url: String,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,
    #[serde(default = "default_renew_spacing_secs")]
    pub renew_spacing_secs: u64,
    #[serde(default)]
    pub require_accepted: bool,
}

impl IngressSettings {
    pub fn to_config(&self) -> IngressConfig {
        IngressConfig {
            bind_addr: self.bind_addr,
            callback_url: self.callback_url.clone(),
            hub_url: self.hub_url.clone(),
            lease_seconds: self.lease_seconds,
            renew_interval: Duration::from_secs(self.renew_interval_secs),
            renew_spacing: Duration::from_secs(self.renew_spacing_secs),
            require_accepted: self.require_accepted,
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_upcoming_poll_start_secs() -> u64 {
    300
}

fn default_url_expire_secs() -> u64 {
    6 * 3600
}

fn default_finish_grace_secs() -> u64 {
    45
}

/// One watched channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    pub channel_id: String,
    pub download_root: PathBuf,
    #[serde(default)]
    pub title_filter: Option<String>,
    /// Polling cadence; absent means push-only discovery.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Bound on how far ahead a scheduled broadcast may start; absent
    /// tracks anything scheduled.
    #[serde(default)]
    pub upcoming_window_secs: Option<u64>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_upcoming_poll_start_secs")]
    pub upcoming_poll_start_secs: u64,
    #[serde(default = "default_url_expire_secs")]
    pub url_expire_secs: u64,
    #[serde(default = "default_finish_grace_secs")]
    pub finish_grace_secs: u64,
}

impl ChannelSettings {
    pub fn to_target(&self) -> ChannelTarget {
        ChannelTarget {
            channel_id: self.channel_id.clone(),
            download_root: self.download_root.clone(),
            title_filter: self.title_filter.clone(),
            poll_interval: self.poll_interval_secs.map(Duration::from_secs),
            upcoming_window: self.upcoming_window_secs.map(Duration::from_secs),
            recorder: RecorderConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                upcoming_poll_start: Duration::from_secs(self.upcoming_poll_start_secs),
                url_expire: Duration::from_secs(self.url_expire_secs),
                finish_grace: Duration::from_secs(self.finish_grace_secs),
            },
        }
    }
}

fn default_room_heartbeat_secs() -> u64 {
    30
}

fn default_error_recover_wait_secs() -> u64 {
    30
}

fn default_chat_host() -> String {
    crate::room::DEFAULT_CHAT_HOST.to_string()
}

fn default_chat_port() -> u16 {
    crate::room::DEFAULT_CHAT_PORT
}

/// One watched live room.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomSettings {
    pub room_id: u64,
    pub download_root: PathBuf,
    #[serde(default)]
    pub title_filter: Option<String>,
    #[serde(default = "default_room_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_error_recover_wait_secs")]
    pub error_recover_wait_secs: u64,
    #[serde(default = "default_chat_host")]
    pub chat_host: String,
    #[serde(default = "default_chat_port")]
    pub chat_port: u16,
    #[serde(default = "default_finish_grace_secs")]
    pub finish_grace_secs: u64,
}

impl RoomSettings {
    pub fn to_target(&self) -> RoomTarget {
        RoomTarget {
            room_id: self.room_id,
            download_root: self.download_root.clone(),
            title_filter: self.title_filter.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            error_recover_wait: Duration::from_secs(self.error_recover_wait_secs),
            chat_host: self.chat_host.clone(),
            chat_port: self.chat_port,
            finish_grace: Duration::from_secs(self.finish_grace_secs),
        }
    }
}

fn default_scheduler_interval_secs() -> u64 {
    15
}

/// One scheduled URL capture.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlSettings {
    pub url: String,
    pub download_root: PathBuf,
    /// Seconds-resolution cron expression of the broadcast schedule.
    pub schedule: String,
    /// Length of each recording window.
    pub duration_secs: u64,
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
}

impl UrlSettings {
    pub fn to_target(&self) -> UrlTarget {
        let mut target = UrlTarget::new(
            self.url.clone(),
            self.download_root.clone(),
            self.schedule.clone(),
            Duration::from_secs(self.duration_secs),
        );
        target.scheduler_interval = Duration::from_secs(self.scheduler_interval_secs);
        target
    }
}

fn default_ytdlp_binary() -> String {
    "yt-dlp".to_string()
}

fn default_youget_binary() -> String {
    "you-get".to_string()
}

fn default_grace_period_secs() -> u64 {
    15
}

fn default_stream_timeout_secs() -> u64 {
    300
}

fn default_read_timeout_secs() -> u64 {
    20
}

fn default_resolve_retry_count() -> u32 {
    5
}

fn default_resolve_retry_interval_secs() -> u64 {
    3
}

/// Downloader backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DownloaderSettings {
    Ytdlp(YtdlpSettings),
    Youget(YougetSettings),
    Puller(PullerSettings),
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self::Ytdlp(YtdlpSettings::default())
    }
}

impl DownloaderSettings {
    /// Build the configured backend.
    pub fn build(&self) -> Arc<dyn DownloaderFactory> {
        match self {
            Self::Ytdlp(settings) => Arc::new(YtdlpDownloader::with_config(YtdlpConfig {
                binary_path: settings.binary_path.clone(),
                extra_args: settings.extra_args.clone(),
                grace_period: Duration::from_secs(settings.grace_period_secs),
            })),
            Self::Youget(settings) => Arc::new(YougetDownloader::with_config(YougetConfig {
                binary_path: settings.binary_path.clone(),
                extra_args: settings.extra_args.clone(),
                grace_period: Duration::from_secs(settings.grace_period_secs),
                info_timeout: Duration::from_secs(30),
            })),
            Self::Puller(settings) => Arc::new(StreamPuller::with_config(PullerConfig {
                stream_timeout: Duration::from_secs(settings.stream_timeout_secs),
                read_timeout: Duration::from_secs(settings.read_timeout_secs),
                resolve_retry_count: settings.resolve_retry_count,
                resolve_retry_interval: Duration::from_secs(settings.resolve_retry_interval_secs),
                playlist_reload: settings.playlist_reload_secs.map(Duration::from_secs),
            })),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct YtdlpSettings {
    #[serde(default = "default_ytdlp_binary")]
    pub binary_path: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for YtdlpSettings {
    fn default() -> Self {
        Self {
            binary_path: default_ytdlp_binary(),
            extra_args: Vec::new(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct YougetSettings {
    #[serde(default = "default_youget_binary")]
    pub binary_path: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullerSettings {
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_resolve_retry_count")]
    pub resolve_retry_count: u32,
    #[serde(default = "default_resolve_retry_interval_secs")]
    pub resolve_retry_interval_secs: u64,
    #[serde(default)]
    pub playlist_reload_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.status_interval_secs, 5);
        assert!(config.ingress.is_none());
        assert!(config.channels.is_empty());
        assert!(config.rooms.is_empty());
        assert!(matches!(config.downloader, DownloaderSettings::Ytdlp(_)));
    }

    #[test]
    fn full_config_round_trips_into_targets() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "ingress": {
                    "callback_url": "https://capture.example/push",
                    "lease_seconds": 1000
                },
                "channels": [{
                    "channel_id": "UC1",
                    "download_root": "videos/one",
                    "title_filter": "^\\[Live\\]",
                    "poll_interval_secs": 900,
                    "upcoming_window_secs": 300
                }],
                "rooms": [{
                    "room_id": 92613,
                    "download_root": "videos/rooms"
                }],
                "urls": [{
                    "url": "https://cam.example/live",
                    "download_root": "videos/cam",
                    "schedule": "0 0 20 * * Fri *",
                    "duration_secs": 3600
                }],
                "downloader": {"kind": "puller", "stream_timeout_secs": 120}
            }"#,
        )
        .unwrap();

        let ingress = config.ingress.as_ref().unwrap().to_config();
        assert_eq!(ingress.callback_url, "https://capture.example/push");
        assert_eq!(ingress.lease_seconds, 1000);
        assert_eq!(ingress.renew_interval, Duration::from_secs(86_400));

        let channel = config.channels[0].to_target();
        assert_eq!(channel.channel_id, "UC1");
        assert_eq!(channel.poll_interval, Some(Duration::from_secs(900)));
        assert_eq!(channel.upcoming_window, Some(Duration::from_secs(300)));
        assert_eq!(
            channel.recorder.heartbeat_interval,
            Duration::from_secs(15)
        );
        assert_eq!(channel.recorder.url_expire, Duration::from_secs(21_600));

        let room = config.rooms[0].to_target();
        assert_eq!(room.room_id, 92613);
        assert_eq!(room.chat_port, 2243);
        assert_eq!(room.heartbeat_interval, Duration::from_secs(30));

        let url = config.urls[0].to_target();
        assert_eq!(url.duration, Duration::from_secs(3600));
        assert_eq!(url.scheduler_interval, Duration::from_secs(15));

        assert!(matches!(
            config.downloader,
            DownloaderSettings::Puller(PullerSettings {
                stream_timeout_secs: 120,
                ..
            })
        ));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = AppConfig::load_or_default("/nonexistent/livecap.json").unwrap();
        assert!(config.channels.is_empty());
    }
}
