//! Per-room watcher.
//!
//! Keeps a persistent framed TCP connection to the chat host; room state
//! events and the welcome frame trigger an HTTP info poll, which starts,
//! restarts or ends the room recording. A detached finisher task drains
//! and reports each recording so the chat loop never blocks.

pub mod info;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chatframe::{FrameBuffer, encode, op, proto};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::downloader::{DownloadHandle, DownloadRequest, DownloaderFactory};
use crate::hooks::{LifecycleHooks, run_post_hook, run_started_hook};
use crate::status::{StatusNode, StatusSource};

pub use info::{BilibiliRoomApi, RoomInfo, RoomInfoSource};

/// Pinned web client version sent in the join payload.
const CLIENT_VER: &str = "1.6.3";

/// Default chat endpoint.
pub const DEFAULT_CHAT_HOST: &str = "broadcastlv.chat.bilibili.com";
pub const DEFAULT_CHAT_PORT: u16 = 2243;

/// Static description of a tracked live room.
#[derive(Debug, Clone)]
pub struct RoomTarget {
    pub room_id: u64,
    pub download_root: PathBuf,
    /// Only live sessions whose title matches are recorded.
    pub title_filter: Option<String>,
    pub heartbeat_interval: Duration,
    /// Pause before reconnecting after a session error.
    pub error_recover_wait: Duration,
    pub chat_host: String,
    pub chat_port: u16,
    /// How long a downloader may keep draining after the room goes
    /// offline before it is interrupted.
    pub finish_grace: Duration,
}

impl RoomTarget {
    pub fn new(room_id: u64, download_root: impl Into<PathBuf>) -> Self {
        Self {
            room_id,
            download_root: download_root.into(),
            title_filter: None,
            heartbeat_interval: Duration::from_secs(30),
            error_recover_wait: Duration::from_secs(30),
            chat_host: DEFAULT_CHAT_HOST.to_string(),
            chat_port: DEFAULT_CHAT_PORT,
            finish_grace: Duration::from_secs(45),
        }
    }
}

/// Shared collaborators handed to every room watcher.
pub struct RoomContext {
    pub info_source: Arc<dyn RoomInfoSource>,
    pub downloader: Arc<dyn DownloaderFactory>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub shutdown: CancellationToken,
}

struct Recording {
    handle: DownloadHandle,
    dir: PathBuf,
}

/// Per-connection state; recreated on reconnect.
struct Session {
    frames: FrameBuffer,
    need_poll: bool,
    heartbeat_due: bool,
    last_activity: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            frames: FrameBuffer::new(),
            need_poll: true,
            heartbeat_due: false,
            last_activity: Instant::now(),
        }
    }
}

/// Watcher of one live room.
pub struct RoomWatcher {
    target: RoomTarget,
    title_filter: Option<Regex>,
    info_source: Arc<dyn RoomInfoSource>,
    downloader: Arc<dyn DownloaderFactory>,
    hooks: Arc<dyn LifecycleHooks>,
    username: Mutex<Option<String>>,
    current_title: Mutex<Option<String>>,
    live_start_time: AtomicI64,
    has_finished: AtomicBool,
    recording: Mutex<Option<Recording>>,
    shutdown: CancellationToken,
}

impl RoomWatcher {
    fn new(target: RoomTarget, ctx: RoomContext) -> Result<Arc<Self>> {
        let title_filter = target
            .title_filter
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Arc::new(Self {
            title_filter,
            info_source: ctx.info_source,
            downloader: ctx.downloader,
            hooks: ctx.hooks,
            username: Mutex::new(None),
            current_title: Mutex::new(None),
            live_start_time: AtomicI64::new(0),
            has_finished: AtomicBool::new(false),
            recording: Mutex::new(None),
            shutdown: ctx.shutdown.child_token(),
            target,
        }))
    }

    /// Create the watcher and start its connection loop.
    pub fn spawn(target: RoomTarget, ctx: RoomContext) -> Result<Arc<Self>> {
        let watcher = Self::new(target, ctx)?;
        info!(room_id = watcher.target.room_id, "Monitoring live room");
        tokio::spawn(run(watcher.clone()));
        Ok(watcher)
    }

    pub fn room_id(&self) -> u64 {
        self.target.room_id
    }

    /// One connection: join, then drive the select loop until an error or
    /// shutdown.
    async fn session(&self) -> Result<()> {
        let mut stream =
            TcpStream::connect((self.target.chat_host.as_str(), self.target.chat_port)).await?;
        debug!(room_id = self.target.room_id, "Connected to chat server");

        let join = serde_json::json!({
            "uid": 0,
            "roomid": self.target.room_id,
            "protover": 2,
            "platform": "web",
            "clientver": CLIENT_VER,
            "type": 2,
        });
        stream
            .write_all(&encode(op::JOIN, proto::INT, &serde_json::to_vec(&join)?))
            .await?;

        let mut session = Session::new();
        let mut next_heartbeat = Instant::now() + self.target.heartbeat_interval;
        let mut buf = vec![0u8; 8 * 1024];

        loop {
            if session.last_activity.elapsed() > 3 * self.target.heartbeat_interval {
                return Err(crate::Error::monitor(format!(
                    "room {} chat connection went stale",
                    self.target.room_id
                )));
            }

            // A downloader that died while the room is live forces a poll.
            if self
                .recording
                .lock()
                .as_ref()
                .is_some_and(|r| !r.handle.is_running())
            {
                session.need_poll = true;
            }
            if session.need_poll {
                match self.poll().await {
                    Ok(()) => session.need_poll = false,
                    // Transient; the next tick retries.
                    Err(e) => error!(room_id = self.target.room_id, "Room poll error: {}", e),
                }
            }
            if session.heartbeat_due || Instant::now() >= next_heartbeat {
                stream
                    .write_all(&encode(op::HEARTBEAT, proto::INT, b""))
                    .await?;
                session.heartbeat_due = false;
                next_heartbeat = Instant::now() + self.target.heartbeat_interval;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(crate::Error::monitor(format!(
                            "room {} chat connection closed",
                            self.target.room_id
                        )));
                    }
                    self.ingest(&mut session, &buf[..n])?;
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    session.heartbeat_due = true;
                }
            }
        }
    }

    /// Consume received bytes, reacting to complete frames.
    fn ingest(&self, session: &mut Session, bytes: &[u8]) -> Result<()> {
        session.frames.extend(bytes);
        while let Some(frame) = session.frames.next_frame()? {
            session.last_activity = Instant::now();
            match frame.operation {
                op::WELCOME => {
                    debug!(room_id = self.target.room_id, "Joined chat room");
                    session.need_poll = true;
                    session.heartbeat_due = true;
                }
                op::EVENT => {
                    if let Ok(event) = frame.json::<Value>()
                        && let Some(cmd) = event.get("cmd").and_then(Value::as_str)
                        && is_state_change(cmd)
                    {
                        debug!(room_id = self.target.room_id, cmd, "Room state event");
                        session.need_poll = true;
                    }
                }
                op::HEARTBEAT_REPLY => {
                    if let Ok(popularity) = frame.as_u32() {
                        debug!(room_id = self.target.room_id, popularity, "Heartbeat reply");
                    }
                }
                other => debug!(room_id = self.target.room_id, operation = other, "Ignored frame"),
            }
        }
        Ok(())
    }

    /// Fetch room info and reconcile the recording with it.
    async fn poll(&self) -> Result<()> {
        let room_info = self.info_source.fetch(self.target.room_id).await?;
        *self.username.lock() = Some(room_info.uname.clone());
        *self.current_title.lock() = Some(room_info.title.clone());

        if room_info.live_status != 1 {
            self.end_recording();
            return Ok(());
        }

        // A changed start time means a new live session: finish the old
        // recording before adopting it.
        let previous_start = self.live_start_time.load(Ordering::SeqCst);
        if previous_start != 0 && previous_start != room_info.live_start_time {
            info!(room_id = self.target.room_id, "Live session restarted");
            self.end_recording();
        }
        self.live_start_time
            .store(room_info.live_start_time, Ordering::SeqCst);

        let stopped = {
            let recording = self.recording.lock();
            match recording.as_ref() {
                None => None,
                Some(r) if !r.handle.is_running() => {
                    Some((r.handle.finished(), r.dir.clone()))
                }
                Some(_) => return Ok(()),
            }
        };

        match stopped {
            None => {
                if let Some(filter) = &self.title_filter
                    && !filter.is_match(&room_info.title)
                {
                    debug!(
                        room_id = self.target.room_id,
                        title = %room_info.title,
                        "Live title filtered out"
                    );
                    return Ok(());
                }
                let dir = self
                    .target
                    .download_root
                    .join(room_info.live_start_time.to_string());
                self.start_recording(dir.clone()).await?;
                run_started_hook(&self.hooks, &self.target.room_id.to_string(), &dir);
            }
            Some((finished, dir)) => {
                if finished {
                    self.has_finished.store(true, Ordering::SeqCst);
                }
                warn!(
                    room_id = self.target.room_id,
                    "Downloader stopped while room still live; restarting"
                );
                self.start_recording(dir).await?;
            }
        }
        Ok(())
    }

    async fn start_recording(&self, dir: PathBuf) -> Result<()> {
        tokio::fs::create_dir_all(&dir).await?;
        let url = format!("https://live.bilibili.com/{}", self.target.room_id);
        let handle = self
            .downloader
            .start(DownloadRequest::new(url, &dir))
            .await?;
        info!(room_id = self.target.room_id, dir = %dir.display(), "Recording live room");
        *self.recording.lock() = Some(Recording { handle, dir });
        Ok(())
    }

    /// Hand the current recording to a detached finisher task and reset
    /// the session bookkeeping.
    fn end_recording(&self) {
        let Some(recording) = self.recording.lock().take() else {
            return;
        };
        let has_finished = self.has_finished.swap(false, Ordering::SeqCst);
        self.live_start_time.store(0, Ordering::SeqCst);

        let hooks = self.hooks.clone();
        let room_key = self.target.room_id.to_string();
        let grace = self.target.finish_grace;
        tokio::spawn(async move {
            let Recording { handle, dir } = recording;
            if !handle.wait(Some(grace)).await {
                handle.interrupt();
                handle.wait(None).await;
            }
            let finished = has_finished || handle.finished();
            handle.kill();
            run_post_hook(&hooks, &room_key, &dir, finished);
        });
    }
}

impl StatusSource for RoomWatcher {
    fn status(&self) -> Vec<StatusNode> {
        let mut line = format!("Room {}", self.target.room_id);
        if let Some(uname) = self.username.lock().as_deref() {
            line.push_str(&format!(" ({})", uname));
        }
        if let Some(title) = self.current_title.lock().as_deref() {
            line.push_str(&format!(" {:?}", title));
        }
        let start = self.live_start_time.load(Ordering::SeqCst);
        if self.recording.lock().is_some() {
            line.push_str(&format!(" [recording since {}]", start));
        } else {
            line.push_str(" [idle]");
        }
        vec![StatusNode::Line(line)]
    }
}

fn is_state_change(cmd: &str) -> bool {
    let base = cmd.split(':').next().unwrap_or(cmd);
    matches!(
        base,
        "LIVE" | "ROUND" | "CLOSE" | "PREPARING" | "END" | "ROOM_CHANGE"
    )
}

/// Connection loop: reconnect after `error_recover_wait` on any session
/// error, until shutdown.
async fn run(watcher: Arc<RoomWatcher>) {
    loop {
        if watcher.shutdown.is_cancelled() {
            break;
        }
        match watcher.session().await {
            Ok(()) => break,
            Err(e) => {
                error!(room_id = watcher.target.room_id, "Room session error: {}", e);
                tokio::select! {
                    _ = watcher.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(watcher.target.error_recover_wait) => {}
                }
            }
        }
    }
    watcher.end_recording();
}
