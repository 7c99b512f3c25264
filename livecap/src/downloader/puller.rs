//! In-process HTTP/HLS byte puller.
//!
//! Resolves the stream URL with bounded retry, sniffs the first buffer to
//! pick a file extension, and writes the stream to `dir/name[.ext]`. Media
//! playlists are pulled segment by segment with periodic reloads;
//! progressive HTTP bodies stream directly and reconnect on EOF. Interrupt
//! is checked at every loop edge; `finished` means a clean end of stream
//! reached without interruption.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Response, Url};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{DownloadHandle, DownloadRequest, DownloaderFactory, DownloaderKind, HandleDriver};
use crate::Result;
use crate::utils::http::build_client;

/// Configuration for the in-process puller.
#[derive(Debug, Clone)]
pub struct PullerConfig {
    /// Maximum silence since the last successful read before the pull
    /// fails.
    pub stream_timeout: Duration,
    /// Deadline for a single read or playlist/segment request.
    pub read_timeout: Duration,
    /// Resolve attempts before giving up.
    pub resolve_retry_count: u32,
    /// Pause between resolve attempts.
    pub resolve_retry_interval: Duration,
    /// Playlist reload cadence; defaults to half the target duration.
    pub playlist_reload: Option<Duration>,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(20),
            resolve_retry_count: 5,
            resolve_retry_interval: Duration::from_secs(3),
            playlist_reload: None,
        }
    }
}

/// In-process stream puller backend.
pub struct StreamPuller {
    config: PullerConfig,
    // Streaming bodies must not race a whole-request deadline, so the
    // puller keeps its own deadline-free client.
    client: reqwest::Client,
}

impl StreamPuller {
    pub fn new() -> Self {
        Self::with_config(PullerConfig::default())
    }

    pub fn with_config(config: PullerConfig) -> Self {
        Self {
            config,
            client: build_client(Duration::ZERO),
        }
    }
}

impl Default for StreamPuller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloaderFactory for StreamPuller {
    async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        tokio::fs::create_dir_all(&request.dir).await?;

        let name = request
            .filename
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());

        info!(url = %request.url, dir = %request.dir.display(), "Downloading with the stream puller");

        let (handle, driver) = DownloadHandle::new(DownloaderKind::Puller);
        let worker = PullWorker {
            client: self.client.clone(),
            config: self.config.clone(),
            url: request.url,
            dir: request.dir,
            name,
        };
        tokio::spawn(async move {
            let success = match worker.run(&driver).await {
                Ok(clean) => clean,
                Err(e) => {
                    error!(url = %worker.url, "Stream pull failed: {}", e);
                    false
                }
            };
            driver.complete(success);
        });
        Ok(handle)
    }
}

struct PullWorker {
    client: reqwest::Client,
    config: PullerConfig,
    url: String,
    dir: PathBuf,
    name: String,
}

impl PullWorker {
    /// Returns whether a clean end of stream was reached.
    async fn run(&self, driver: &HandleDriver) -> Result<bool> {
        let Some(resp) = self.resolve(driver).await? else {
            return Ok(false);
        };

        if is_playlist(&resp) {
            self.pull_playlist(resp, driver).await
        } else {
            self.pull_progressive(resp, driver).await
        }
    }

    /// Resolve the stream URL with bounded retry. `None` means the pull
    /// was interrupted while resolving.
    async fn resolve(&self, driver: &HandleDriver) -> Result<Option<Response>> {
        let mut last_err = String::new();
        for attempt in 1..=self.config.resolve_retry_count {
            if driver.interrupt.is_cancelled() {
                return Ok(None);
            }
            let sent = tokio::time::timeout(
                self.config.read_timeout,
                self.client.get(&self.url).send(),
            )
            .await;
            match sent {
                Ok(Ok(resp)) => match resp.error_for_status() {
                    Ok(resp) => return Ok(Some(resp)),
                    Err(e) => last_err = e.to_string(),
                },
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "resolve timed out".to_string(),
            }
            debug!(url = %self.url, attempt, "Failed to resolve stream: {}", last_err);
            if attempt < self.config.resolve_retry_count {
                tokio::select! {
                    _ = driver.interrupt.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.config.resolve_retry_interval) => {}
                }
            }
        }
        Err(crate::Error::Download(format!(
            "Failed to resolve {}: {}",
            self.url, last_err
        )))
    }

    async fn pull_progressive(&self, mut resp: Response, driver: &HandleDriver) -> Result<bool> {
        let mut out: Option<File> = None;
        let mut last_active = Instant::now();

        loop {
            let read = tokio::select! {
                _ = driver.interrupt.cancelled() => return Ok(false),
                read = tokio::time::timeout(self.config.read_timeout, resp.chunk()) => read,
            };

            match read {
                // Read deadline: tolerated while within the stall budget.
                Err(_) => {
                    if last_active.elapsed() >= self.config.stream_timeout {
                        return Err(crate::Error::Download(format!(
                            "No data from {} within stall budget",
                            self.url
                        )));
                    }
                    debug!(url = %self.url, "Stream read retry");
                }
                Ok(Ok(Some(bytes))) => {
                    last_active = Instant::now();
                    let file = self.ensure_file(&mut out, &bytes).await?;
                    file.write_all(&bytes).await?;
                }
                Ok(Ok(None)) => {
                    if let Some(file) = out.as_mut() {
                        file.flush().await?;
                    }
                    // Plain-HTTP live sources resume after a reconnect; a
                    // refused reconnect marks the end of the stream.
                    let reopened = tokio::time::timeout(
                        self.config.read_timeout,
                        self.client.get(&self.url).send(),
                    )
                    .await
                    .map_err(|_| {
                        crate::Error::Download(format!("Reconnect to {} timed out", self.url))
                    })??;
                    match reopened.error_for_status() {
                        Ok(new_resp) => {
                            info!(url = %self.url, "Reconnecting to stream");
                            resp = new_resp;
                        }
                        Err(e) => {
                            debug!(url = %self.url, "Stream over: {}", e);
                            return Ok(true);
                        }
                    }
                }
                Ok(Err(e)) => {
                    if e.is_timeout() && last_active.elapsed() < self.config.stream_timeout {
                        debug!(url = %self.url, "Stream read retry");
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn pull_playlist(&self, resp: Response, driver: &HandleDriver) -> Result<bool> {
        let mut base = resp.url().clone();
        let mut body = self.read_body(resp).await?.to_vec();

        // Master playlists are followed to their first variant.
        if let Ok(m3u8_rs::Playlist::MasterPlaylist(master)) =
            m3u8_rs::parse_playlist_res(&body)
        {
            let variant = master.variants.first().ok_or_else(|| {
                crate::Error::Download(format!("Master playlist {} has no variants", base))
            })?;
            base = join_url(&base, &variant.uri)?;
            body = self.fetch_bytes(base.clone()).await?.to_vec();
        }

        let mut out: Option<File> = None;
        let mut next_seq: u64 = 0;
        let mut last_active = Instant::now();

        loop {
            let playlist = m3u8_rs::parse_media_playlist_res(&body)
                .map_err(|e| crate::Error::Download(format!("Invalid media playlist: {:?}", e)))?;

            for (idx, segment) in playlist.segments.iter().enumerate() {
                let seq = playlist.media_sequence + idx as u64;
                if seq < next_seq {
                    continue;
                }
                if driver.interrupt.is_cancelled() {
                    return Ok(false);
                }
                let segment_url = join_url(&base, &segment.uri)?;
                let bytes = self.fetch_bytes(segment_url).await?;
                let file = self.ensure_file(&mut out, &bytes).await?;
                file.write_all(&bytes).await?;
                next_seq = seq + 1;
                last_active = Instant::now();
            }

            if playlist.end_list {
                if let Some(file) = out.as_mut() {
                    file.flush().await?;
                }
                return Ok(true);
            }
            if last_active.elapsed() >= self.config.stream_timeout {
                return Err(crate::Error::Download(format!(
                    "Playlist {} produced no new segments within stall budget",
                    base
                )));
            }

            let reload = self.config.playlist_reload.unwrap_or_else(|| {
                Duration::from_secs((playlist.target_duration / 2).max(1))
            });
            tokio::select! {
                _ = driver.interrupt.cancelled() => return Ok(false),
                _ = tokio::time::sleep(reload) => {}
            }
            body = self.fetch_bytes(base.clone()).await?.to_vec();
        }
    }

    async fn fetch_bytes(&self, url: Url) -> Result<Bytes> {
        let resp = tokio::time::timeout(self.config.read_timeout, self.client.get(url).send())
            .await
            .map_err(|_| crate::Error::Download("Request timed out".to_string()))??
            .error_for_status()?;
        self.read_body(resp).await
    }

    async fn read_body(&self, resp: Response) -> Result<Bytes> {
        Ok(
            tokio::time::timeout(self.config.stream_timeout, resp.bytes())
                .await
                .map_err(|_| crate::Error::Download("Body read timed out".to_string()))??,
        )
    }

    /// Lazily create the output file, naming it from the first buffer.
    async fn ensure_file<'a>(
        &self,
        out: &'a mut Option<File>,
        first: &[u8],
    ) -> Result<&'a mut File> {
        if out.is_none() {
            let file_name = match sniff_extension(first) {
                Some(ext) => format!("{}.{}", self.name, ext),
                None => self.name.clone(),
            };
            let path = self.dir.join(file_name);
            info!(path = %path.display(), "Download destination");
            *out = Some(File::create(&path).await?);
        }
        Ok(out.as_mut().expect("output file just created"))
    }
}

fn is_playlist(resp: &Response) -> bool {
    let by_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("mpegurl"));
    by_type || resp.url().path().ends_with(".m3u8")
}

fn join_url(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri)
        .map_err(|e| crate::Error::Download(format!("Bad segment URI {}: {}", uri, e)))
}

/// Guess a file extension from the first buffer of stream data.
fn sniff_extension(buf: &[u8]) -> Option<String> {
    if let Some(kind) = infer::get(buf) {
        return Some(kind.extension().to_string());
    }
    // MPEG-TS is not magic-number friendly: look for sync bytes at packet
    // boundaries.
    if buf.len() >= 189 && buf[0] == 0x47 && buf[188] == 0x47 {
        return Some("ts".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sniffs_ts_sync_bytes() {
        let mut packet = vec![0u8; 376];
        packet[0] = 0x47;
        packet[188] = 0x47;
        assert_eq!(sniff_extension(&packet), Some("ts".to_string()));
    }

    #[test]
    fn sniffs_flv_magic() {
        let mut buf = b"FLV\x01\x05\x00\x00\x00\x09".to_vec();
        buf.resize(512, 0);
        assert_eq!(sniff_extension(&buf), Some("flv".to_string()));
    }

    #[test]
    fn unknown_bytes_have_no_extension() {
        assert_eq!(sniff_extension(b"plain text data"), None);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn progressive_pull_ends_cleanly_when_reconnect_is_refused() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new().route(
            "/stream",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::OK, "stream-bytes".to_string())
                } else {
                    (StatusCode::GONE, String::new())
                }
            })
            .with_state(hits.clone()),
        );
        let base = serve(router).await;

        let dir = tempfile::tempdir().unwrap();
        let puller = StreamPuller::with_config(PullerConfig {
            read_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(5),
            resolve_retry_count: 2,
            resolve_retry_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let handle = puller
            .start(
                DownloadRequest::new(format!("{}/stream", base), dir.path())
                    .with_filename("capture"),
            )
            .await
            .unwrap();

        assert!(handle.wait(Some(Duration::from_secs(10))).await);
        assert!(handle.finished());
        let written = std::fs::read_to_string(dir.path().join("capture")).unwrap();
        assert_eq!(written, "stream-bytes");
    }

    #[tokio::test]
    async fn resolve_gives_up_after_bounded_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new().route(
            "/stream",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            })
            .with_state(hits.clone()),
        );
        let base = serve(router).await;

        let dir = tempfile::tempdir().unwrap();
        let puller = StreamPuller::with_config(PullerConfig {
            resolve_retry_count: 3,
            resolve_retry_interval: Duration::from_millis(5),
            ..Default::default()
        });
        let handle = puller
            .start(DownloadRequest::new(format!("{}/stream", base), dir.path()))
            .await
            .unwrap();

        assert!(handle.wait(Some(Duration::from_secs(10))).await);
        assert!(!handle.finished());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn playlist_pull_collects_segments_until_endlist() {
        let playlist = "#EXTM3U\n\
                        #EXT-X-VERSION:3\n\
                        #EXT-X-TARGETDURATION:2\n\
                        #EXT-X-MEDIA-SEQUENCE:0\n\
                        #EXTINF:2.0,\nseg0.bin\n\
                        #EXTINF:2.0,\nseg1.bin\n\
                        #EXT-X-ENDLIST\n";
        let router = Router::new()
            .route(
                "/live/index.m3u8",
                get(move || async move {
                    ([("content-type", "application/vnd.apple.mpegurl")], playlist)
                }),
            )
            .route("/live/seg0.bin", get(|| async { "AAAA" }))
            .route("/live/seg1.bin", get(|| async { "BBBB" }));
        let base = serve(router).await;

        let dir = tempfile::tempdir().unwrap();
        let puller = StreamPuller::with_config(PullerConfig {
            read_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let handle = puller
            .start(
                DownloadRequest::new(format!("{}/live/index.m3u8", base), dir.path())
                    .with_filename("room"),
            )
            .await
            .unwrap();

        assert!(handle.wait(Some(Duration::from_secs(10))).await);
        assert!(handle.finished());
        let written = std::fs::read_to_string(dir.path().join("room")).unwrap();
        assert_eq!(written, "AAAABBBB");
    }
}
