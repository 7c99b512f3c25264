//! livecap - livestream capture supervisor daemon.

use std::sync::Arc;
use std::time::Duration;

use livecap::channel::{ChannelContext, ChannelListing, ChannelWatcher, YoutubeChannelListing};
use livecap::config::AppConfig;
use livecap::hooks::LifecycleHooks;
use livecap::ingress::PushIngress;
use livecap::logging::init_logging;
use livecap::recorder::{HeartbeatOracle, LivenessOracle};
use livecap::room::{BilibiliRoomApi, RoomContext, RoomInfoSource, RoomWatcher};
use livecap::schedule::{UrlContext, UrlStreamWatcher};
use livecap::status::{StatusRegistry, StatusSource, run_printer};
use livecap::utils::http::build_client;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn register_status(source: &Arc<impl StatusSource + 'static>) {
    let source: Arc<dyn StatusSource> = source.clone();
    StatusRegistry::global().register(Arc::downgrade(&source));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("LIVECAP_CONFIG").unwrap_or_else(|_| "livecap.json".to_string());
    let config = AppConfig::load_or_default(&config_path)?;

    let _guard = init_logging(&config.log_dir)?;
    info!("Starting livecap v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let client = build_client(Duration::from_secs(config.http_timeout_secs));

    let downloader = config.downloader.build();
    let hooks: Arc<dyn LifecycleHooks> = Arc::new(config.hooks.clone());
    let oracle: Arc<dyn LivenessOracle> = Arc::new(HeartbeatOracle::new(client.clone()));
    let listing: Arc<dyn ChannelListing> = Arc::new(YoutubeChannelListing::new(client.clone()));
    let room_info: Arc<dyn RoomInfoSource> = Arc::new(BilibiliRoomApi::new(client.clone()));

    let ingress = match &config.ingress {
        Some(settings) => {
            let ingress =
                PushIngress::start(settings.to_config(), client.clone(), shutdown.clone()).await?;
            register_status(&ingress);
            Some(ingress)
        }
        None => None,
    };

    let mut channel_watchers = Vec::new();
    for settings in &config.channels {
        let watcher = ChannelWatcher::start(
            settings.to_target(),
            ChannelContext {
                listing: listing.clone(),
                oracle: oracle.clone(),
                downloader: downloader.clone(),
                hooks: hooks.clone(),
                shutdown: shutdown.clone(),
            },
            ingress.as_ref(),
        )
        .await?;
        register_status(&watcher);
        channel_watchers.push(watcher);
    }

    let mut room_watchers = Vec::new();
    for settings in &config.rooms {
        let watcher = RoomWatcher::spawn(
            settings.to_target(),
            RoomContext {
                info_source: room_info.clone(),
                downloader: downloader.clone(),
                hooks: hooks.clone(),
                shutdown: shutdown.clone(),
            },
        )?;
        register_status(&watcher);
        room_watchers.push(watcher);
    }

    let mut url_watchers = Vec::new();
    for settings in &config.urls {
        let watcher = UrlStreamWatcher::spawn(
            settings.to_target(),
            UrlContext {
                downloader: downloader.clone(),
                hooks: hooks.clone(),
                shutdown: shutdown.clone(),
            },
        )?;
        register_status(&watcher);
        url_watchers.push(watcher);
    }

    info!(
        channels = channel_watchers.len(),
        rooms = room_watchers.len(),
        urls = url_watchers.len(),
        "livecap started"
    );

    let printer = tokio::spawn(run_printer(
        Duration::from_secs(config.status_interval_secs),
        shutdown.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    shutdown.cancel();
    // The printer emits one final report before exiting.
    let _ = printer.await;
    info!("livecap shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler registration");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
