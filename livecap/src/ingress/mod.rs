//! Push ingress.
//!
//! One HTTP server receives hub subscription challenges (GET) and Atom
//! update notifications (POST) for every watched channel. The ingress owns
//! the channel → watchers index (weak references only) and a lease-renewal
//! loop that re-subscribes each known channel daily.

pub mod atom;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::channel::ChannelWatcher;
use crate::status::{StatusNode, StatusSource};

pub use atom::FeedEntry;

/// Configuration of the push ingress.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Externally reachable callback URL registered with the hub.
    pub callback_url: String,
    /// Subscription hub endpoint.
    pub hub_url: String,
    /// Requested lease duration.
    pub lease_seconds: u64,
    /// Cadence of the lease-renewal loop.
    pub renew_interval: Duration,
    /// Pause between renewal requests.
    pub renew_spacing: Duration,
    /// Require the hub to answer 202 instead of any 2xx.
    pub require_accepted: bool,
}

impl IngressConfig {
    pub fn new(bind_addr: SocketAddr, callback_url: impl Into<String>) -> Self {
        Self {
            bind_addr,
            callback_url: callback_url.into(),
            hub_url: "https://pubsubhubbub.appspot.com".to_string(),
            lease_seconds: 432_000,
            renew_interval: Duration::from_secs(86_400),
            renew_spacing: Duration::from_secs(5),
            require_accepted: false,
        }
    }
}

struct Subscription {
    watchers: Vec<Weak<ChannelWatcher>>,
    last_renewal: DateTime<Utc>,
}

/// The push ingress server and subscription index.
pub struct PushIngress {
    config: IngressConfig,
    client: reqwest::Client,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl PushIngress {
    /// Bind the server, start the acceptor and the lease-renewal loop.
    pub async fn start(
        config: IngressConfig,
        client: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let ingress = Arc::new(Self {
            config,
            client,
            subscriptions: Mutex::new(HashMap::new()),
            local_addr,
            shutdown: shutdown.child_token(),
        });

        let router = ingress.router();
        let serve_shutdown = ingress.shutdown.clone();
        tokio::spawn(async move {
            let serving = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });
            if let Err(e) = serving.await {
                error!("Ingress server error: {}", e);
            }
        });
        tokio::spawn(renew_loop(ingress.clone()));

        info!(addr = %local_addr, "Serving push ingress");
        Ok(ingress)
    }

    /// Address the server actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of channels with at least one subscribed watcher.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Subscribe a watcher to a channel's notifications.
    ///
    /// The hub request must succeed; at startup this error propagates to
    /// the caller.
    pub async fn subscribe(&self, channel_id: &str, watcher: &Arc<ChannelWatcher>) -> Result<()> {
        self.request_subscription(channel_id).await?;

        let mut subscriptions = self.subscriptions.lock();
        let entry = subscriptions
            .entry(channel_id.to_string())
            .or_insert_with(|| Subscription {
                watchers: Vec::new(),
                last_renewal: Utc::now(),
            });
        entry.last_renewal = Utc::now();
        let incoming = Arc::downgrade(watcher);
        if !entry.watchers.iter().any(|w| w.ptr_eq(&incoming)) {
            entry.watchers.push(incoming);
        }
        info!(channel_id, "Subscribed to channel");
        Ok(())
    }

    async fn request_subscription(&self, channel_id: &str) -> Result<()> {
        let topic = format!(
            "https://www.youtube.com/xml/feeds/videos.xml?channel_id={}",
            channel_id
        );
        let lease = self.config.lease_seconds.to_string();
        let form = [
            ("hub.callback", self.config.callback_url.as_str()),
            ("hub.mode", "subscribe"),
            ("hub.verify", "sync"),
            ("hub.topic", topic.as_str()),
            ("hub.lease_seconds", lease.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.hub_url)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let accepted = if self.config.require_accepted {
            status == StatusCode::ACCEPTED
        } else {
            status.is_success()
        };
        if !accepted {
            return Err(crate::Error::subscription(format!(
                "hub returned {} for channel {}",
                status, channel_id
            )));
        }
        Ok(())
    }

    /// Deliver feed entries to the subscribed watchers.
    ///
    /// Dispatch happens under the subscriptions lock, preserving delivery
    /// order per watcher. Channels whose watcher sets died out are dropped
    /// from the index.
    fn dispatch(&self, entries: Vec<FeedEntry>) {
        let mut subscriptions = self.subscriptions.lock();
        for entry in entries {
            info!(video_id = %entry.video_id, title = %entry.title, "Push notification");
            let Some(subscription) = subscriptions.get_mut(&entry.channel_id) else {
                debug!(channel_id = %entry.channel_id, "Notification for unknown channel");
                continue;
            };
            subscription.watchers.retain(|w| w.strong_count() > 0);
            for watcher in subscription.watchers.iter().filter_map(Weak::upgrade) {
                watcher.watch_video(&entry.video_id, &entry.title);
            }
            if subscription.watchers.is_empty() {
                subscriptions.remove(&entry.channel_id);
            }
        }
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(challenge).post(notify))
            .with_state(self.clone())
    }
}

impl StatusSource for PushIngress {
    fn status(&self) -> Vec<StatusNode> {
        let subscriptions = self.subscriptions.lock();
        let mut lines: Vec<String> = subscriptions
            .iter()
            .map(|(channel_id, sub)| {
                format!(
                    "{} renewed {}",
                    channel_id,
                    sub.last_renewal.format("%Y-%m-%d %H:%M:%S")
                )
            })
            .collect();
        lines.sort();
        vec![
            StatusNode::line(format!(
                "Push ingress on {} ({} subscriptions)",
                self.local_addr,
                subscriptions.len()
            )),
            StatusNode::Group(lines.into_iter().map(StatusNode::Line).collect()),
        ]
    }
}

/// GET: a request carrying `hub.challenge` is answered with the raw
/// challenge value; anything else is a bad request.
async fn challenge(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("hub.challenge") {
        Some(value) => (StatusCode::OK, value.clone()).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// POST: an Atom notification body. Malformed bodies are logged but still
/// answered 200 to stop the hub from redelivering them.
async fn notify(State(ingress): State<Arc<PushIngress>>, body: String) -> StatusCode {
    debug!(bytes = body.len(), "Notification received");
    match atom::parse_feed(&body) {
        Ok(entries) => ingress.dispatch(entries),
        Err(e) => warn!("Ignoring malformed notification: {}", e),
    }
    StatusCode::OK
}

/// Re-subscribe every known channel once per renewal interval. Failures
/// are logged and never abort the loop.
async fn renew_loop(ingress: Arc<PushIngress>) {
    loop {
        tokio::select! {
            _ = ingress.shutdown.cancelled() => return,
            _ = tokio::time::sleep(ingress.config.renew_interval) => {}
        }

        let channel_ids: Vec<String> = {
            let mut subscriptions = ingress.subscriptions.lock();
            subscriptions.retain(|_, sub| {
                sub.watchers.retain(|w| w.strong_count() > 0);
                !sub.watchers.is_empty()
            });
            subscriptions.keys().cloned().collect()
        };

        for channel_id in channel_ids {
            match ingress.request_subscription(&channel_id).await {
                Ok(()) => {
                    debug!(channel_id = %channel_id, "Lease renewed");
                    if let Some(sub) = ingress.subscriptions.lock().get_mut(&channel_id) {
                        sub.last_renewal = Utc::now();
                    }
                }
                Err(e) => error!(channel_id = %channel_id, "Re-subscribing error: {}", e),
            }
            tokio::select! {
                _ = ingress.shutdown.cancelled() => return,
                _ = tokio::time::sleep(ingress.config.renew_spacing) => {}
            }
        }
    }
}
