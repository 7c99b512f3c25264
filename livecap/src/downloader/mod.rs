//! Downloader backends and the uniform handle over them.
//!
//! Every backend exposes the same capability set through
//! [`DownloadHandle`]: cooperative `interrupt`, unconditional `kill`,
//! `wait` with optional timeout, `is_running` and `finished`. Backends are
//! started through the [`DownloaderFactory`] seam so watchers and tests can
//! swap implementations.

pub mod process;
pub mod puller;
pub mod ytdlp;
pub mod youget;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use puller::{PullerConfig, StreamPuller};
pub use ytdlp::{YtdlpConfig, YtdlpDownloader};
pub use youget::{YougetConfig, YougetDownloader};

/// Kind of downloader backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    /// General-purpose extractor child process.
    #[default]
    Ytdlp,
    /// Alternative extractor child process.
    Youget,
    /// In-process HTTP/HLS byte puller.
    Puller,
}

impl DownloaderKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ytdlp => "ytdlp",
            Self::Youget => "youget",
            Self::Puller => "puller",
        }
    }
}

impl std::str::FromStr for DownloaderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ytdlp" => Ok(Self::Ytdlp),
            "youget" => Ok(Self::Youget),
            "puller" => Ok(Self::Puller),
            _ => Err(format!("Unknown downloader kind: {}", s)),
        }
    }
}

impl std::fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a backend is asked to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Stream or page URL.
    pub url: String,
    /// Output directory; created if missing.
    pub dir: PathBuf,
    /// Base output filename without extension. Backends fall back to their
    /// own default (video id template, epoch seconds) when absent.
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Terminal outcome of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Whether the backend ended cleanly with its artifact in place.
    pub success: bool,
}

/// Handle to an active download.
///
/// `interrupt` requests a cooperative stop and returns immediately; the
/// backend terminates soon after without corrupting its output. `kill` is
/// unconditional and idempotent. `wait` observes termination.
#[derive(Debug)]
pub struct DownloadHandle {
    kind: DownloaderKind,
    interrupt_token: CancellationToken,
    kill_token: CancellationToken,
    outcome_rx: watch::Receiver<Option<DownloadOutcome>>,
}

impl DownloadHandle {
    pub(crate) fn new(kind: DownloaderKind) -> (Self, HandleDriver) {
        let interrupt_token = CancellationToken::new();
        let kill_token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        (
            Self {
                kind,
                interrupt_token: interrupt_token.clone(),
                kill_token: kill_token.clone(),
                outcome_rx,
            },
            HandleDriver {
                interrupt: interrupt_token,
                kill: kill_token,
                outcome_tx,
            },
        )
    }

    pub fn kind(&self) -> DownloaderKind {
        self.kind
    }

    /// Request a cooperative stop.
    pub fn interrupt(&self) {
        self.interrupt_token.cancel();
    }

    /// Stop immediately. Idempotent.
    pub fn kill(&self) {
        self.kill_token.cancel();
        self.interrupt_token.cancel();
    }

    /// Whether the backend has not yet terminated.
    pub fn is_running(&self) -> bool {
        self.outcome_rx.borrow().is_none()
    }

    /// Block until the backend terminates, up to `timeout` if given.
    /// Returns whether it has terminated.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.outcome_rx.clone();
        let ended = rx.wait_for(|outcome| outcome.is_some());
        match timeout {
            Some(limit) => matches!(tokio::time::timeout(limit, ended).await, Ok(_)),
            None => {
                // A closed channel means the driver is gone; the backend
                // cannot still be running.
                let _ = ended.await;
                true
            }
        }
    }

    /// Whether the backend terminated successfully.
    pub fn finished(&self) -> bool {
        matches!(*self.outcome_rx.borrow(), Some(outcome) if outcome.success)
    }
}

/// Backend-side counterpart of a [`DownloadHandle`].
pub(crate) struct HandleDriver {
    pub(crate) interrupt: CancellationToken,
    pub(crate) kill: CancellationToken,
    outcome_tx: watch::Sender<Option<DownloadOutcome>>,
}

impl HandleDriver {
    /// Publish the terminal outcome. Later calls are ignored.
    pub(crate) fn complete(&self, success: bool) {
        self.outcome_tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(DownloadOutcome { success });
                true
            } else {
                false
            }
        });
    }
}

/// Trait for downloader backends.
#[async_trait]
pub trait DownloaderFactory: Send + Sync {
    /// Start a download and return its handle.
    async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable downloader plumbing shared by watcher and recorder tests.

    use super::*;

    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A factory whose handles run until interrupted or killed, recording
    /// every start request.
    pub(crate) struct MockFactory {
        pub(crate) starts: AtomicUsize,
        pub(crate) requests: Mutex<Vec<DownloadRequest>>,
        pub(crate) drivers: Mutex<Vec<Arc<HandleDriver>>>,
        /// Outcome reported when a handle is interrupted.
        pub(crate) success_on_interrupt: bool,
    }

    impl MockFactory {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                drivers: Mutex::new(Vec::new()),
                success_on_interrupt: true,
            })
        }

        pub(crate) fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        /// Finish the `index`-th started download with the given outcome.
        pub(crate) fn complete(&self, index: usize, success: bool) {
            self.drivers.lock()[index].complete(success);
        }
    }

    #[async_trait]
    impl DownloaderFactory for MockFactory {
        async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);

            let (handle, driver) = DownloadHandle::new(DownloaderKind::Puller);
            let driver = Arc::new(driver);
            self.drivers.lock().push(driver.clone());

            let success_on_interrupt = self.success_on_interrupt;
            tokio::spawn(async move {
                tokio::select! {
                    _ = driver.kill.cancelled() => driver.complete(false),
                    _ = driver.interrupt.cancelled() => driver.complete(success_on_interrupt),
                }
            });
            Ok(handle)
        }
    }
}
