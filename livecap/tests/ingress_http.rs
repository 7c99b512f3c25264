//! End-to-end tests of the push ingress HTTP surface: challenge handshake,
//! notification dispatch into a subscribed channel watcher, subscription
//! failure at startup, and lease renewal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use chrono::Utc;
use livecap::channel::{ChannelContext, ChannelListing, ChannelTarget, ChannelWatcher};
use livecap::downloader::StreamPuller;
use livecap::hooks::NoopHooks;
use livecap::ingress::{IngressConfig, PushIngress};
use livecap::recorder::{HeartbeatStatus, LivenessOracle};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Oracle that keeps every broadcast waiting.
struct WaitingOracle;

#[async_trait]
impl LivenessOracle for WaitingOracle {
    async fn check(&self, _video_id: &str) -> livecap::Result<HeartbeatStatus> {
        Ok(HeartbeatStatus::Offline {
            display_endscreen: false,
            scheduled_start: Some(Utc::now().timestamp() + 3600),
        })
    }
}

/// Listing with nothing to discover.
struct EmptyListing;

#[async_trait]
impl ChannelListing for EmptyListing {
    async fn fetch(&self, _channel_id: &str) -> livecap::Result<Value> {
        Ok(json!({}))
    }
}

/// A stub subscription hub counting requests.
async fn stub_hub(status: StatusCode) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/",
        post(move |State(hits): State<Arc<AtomicUsize>>| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            status
        })
        .with_state(hits.clone()),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, hits)
}

fn ingress_config(hub: SocketAddr) -> IngressConfig {
    let mut config = IngressConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        "https://capture.example/push",
    );
    config.hub_url = format!("http://{}/", hub);
    config
}

async fn start_ingress(config: IngressConfig) -> Arc<PushIngress> {
    PushIngress::start(config, reqwest::Client::new(), CancellationToken::new())
        .await
        .unwrap()
}

async fn subscribed_watcher(
    ingress: &Arc<PushIngress>,
    channel_id: &str,
    title_filter: Option<&str>,
) -> Arc<ChannelWatcher> {
    let tmp = tempfile::tempdir().unwrap();
    let mut target = ChannelTarget::new(channel_id, tmp.path());
    target.title_filter = title_filter.map(str::to_string);
    target.recorder.heartbeat_interval = Duration::from_millis(50);
    ChannelWatcher::start(
        target,
        ChannelContext {
            listing: Arc::new(EmptyListing),
            oracle: Arc::new(WaitingOracle),
            downloader: Arc::new(StreamPuller::new()),
            hooks: Arc::new(NoopHooks),
            shutdown: CancellationToken::new(),
        },
        Some(ingress),
    )
    .await
    .unwrap()
}

fn notification(channel_id: &str, video_id: &str, title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <yt:videoId>{video_id}</yt:videoId>
    <yt:channelId>{channel_id}</yt:channelId>
    <title>{title}</title>
  </entry>
</feed>"#
    )
}

#[tokio::test]
async fn challenge_is_echoed_and_anything_else_rejected() {
    let (hub, _) = stub_hub(StatusCode::NO_CONTENT).await;
    let ingress = start_ingress(ingress_config(hub)).await;
    let base = format!("http://{}", ingress.local_addr());
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/?hub.challenge=abc123&hub.mode=subscribe", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "abc123");

    let response = client.get(format!("{}/?x=1", base)).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn notification_dispatches_to_the_subscribed_watcher() {
    let (hub, _) = stub_hub(StatusCode::ACCEPTED).await;
    let ingress = start_ingress(ingress_config(hub)).await;
    let watcher = subscribed_watcher(&ingress, "UC1", None).await;
    assert_eq!(ingress.subscription_count(), 1);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/", ingress.local_addr()))
        .body(notification("UC1", "v42", "Stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(watcher.tracking_count(), 1);

    // Redelivery marks the existing broadcast instead of duplicating it.
    client
        .post(format!("http://{}/", ingress.local_addr()))
        .body(notification("UC1", "v42", "Stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(watcher.tracking_count(), 1);

    // Notifications for unknown channels are accepted and dropped.
    let response = client
        .post(format!("http://{}/", ingress.local_addr()))
        .body(notification("UC-unknown", "v1", "Other"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(watcher.tracking_count(), 1);
}

#[tokio::test]
async fn title_filter_applies_to_pushed_broadcasts() {
    let (hub, _) = stub_hub(StatusCode::ACCEPTED).await;
    let ingress = start_ingress(ingress_config(hub)).await;
    let watcher = subscribed_watcher(&ingress, "UC1", Some(r"^\[Live\]")).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{}/", ingress.local_addr()))
        .body(notification("UC1", "plainvid", "plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(watcher.tracking_count(), 0);

    client
        .post(format!("http://{}/", ingress.local_addr()))
        .body(notification("UC1", "livevid", "[Live] X"))
        .send()
        .await
        .unwrap();
    assert_eq!(watcher.tracking_count(), 1);
}

#[tokio::test]
async fn malformed_notification_is_acknowledged() {
    let (hub, _) = stub_hub(StatusCode::ACCEPTED).await;
    let ingress = start_ingress(ingress_config(hub)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/", ingress.local_addr()))
        .body("this is << not xml")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn failed_hub_subscription_propagates_at_startup() {
    let (hub, _) = stub_hub(StatusCode::INTERNAL_SERVER_ERROR).await;
    let ingress = start_ingress(ingress_config(hub)).await;

    let tmp = tempfile::tempdir().unwrap();
    let result = ChannelWatcher::start(
        ChannelTarget::new("UC1", tmp.path()),
        ChannelContext {
            listing: Arc::new(EmptyListing),
            oracle: Arc::new(WaitingOracle),
            downloader: Arc::new(StreamPuller::new()),
            hooks: Arc::new(NoopHooks),
            shutdown: CancellationToken::new(),
        },
        Some(&ingress),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(ingress.subscription_count(), 0);
}

#[tokio::test]
async fn strict_mode_requires_accepted() {
    let (hub, _) = stub_hub(StatusCode::OK).await;
    let mut config = ingress_config(hub);
    config.require_accepted = true;
    let ingress = start_ingress(config).await;

    let tmp = tempfile::tempdir().unwrap();
    let result = ChannelWatcher::start(
        ChannelTarget::new("UC1", tmp.path()),
        ChannelContext {
            listing: Arc::new(EmptyListing),
            oracle: Arc::new(WaitingOracle),
            downloader: Arc::new(StreamPuller::new()),
            hooks: Arc::new(NoopHooks),
            shutdown: CancellationToken::new(),
        },
        Some(&ingress),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn lease_renewal_keeps_resubscribing() {
    let (hub, hits) = stub_hub(StatusCode::ACCEPTED).await;
    let mut config = ingress_config(hub);
    config.renew_interval = Duration::from_millis(50);
    config.renew_spacing = Duration::from_millis(1);
    let ingress = start_ingress(config).await;
    let _watcher = subscribed_watcher(&ingress, "UC1", None).await;

    let initial = hits.load(Ordering::SeqCst);
    assert_eq!(initial, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        hits.load(Ordering::SeqCst) >= 3,
        "expected periodic renewals, saw {}",
        hits.load(Ordering::SeqCst)
    );
}
