//! Lifecycle hooks.
//!
//! Hooks fire at recording edges: `started_download` once per recording
//! start, `post_download` once per recording end on every path, including
//! errors. Hook failures and panics are caught and logged; they never
//! influence the recording lifecycle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::Result;

/// Callbacks invoked at recording lifecycle edges.
///
/// `target_key` identifies the recorded target: the video id for channel
/// broadcasts, the room id for live rooms, the URL for scheduled streams.
pub trait LifecycleHooks: Send + Sync {
    /// Called once when a recording starts, before heartbeat polling
    /// resumes.
    fn started_download(&self, target_key: &str, dir: &Path) -> Result<()> {
        let _ = (target_key, dir);
        Ok(())
    }

    /// Called once when a recording ends; `finished` reports whether the
    /// downloader completed cleanly.
    fn post_download(&self, target_key: &str, dir: &Path, finished: bool) -> Result<()> {
        let _ = (target_key, dir, finished);
        Ok(())
    }
}

/// Hooks that do nothing.
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Hooks that run configured shell commands.
///
/// The command receives `LIVECAP_TARGET`, `LIVECAP_DIR` and (for the end
/// hook) `LIVECAP_FINISHED` in its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandHooks {
    /// Command to execute when a recording starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_download_start: Option<String>,
    /// Command to execute when a recording ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_download_end: Option<String>,
}

impl CommandHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_download_start(mut self, command: impl Into<String>) -> Self {
        self.on_download_start = Some(command.into());
        self
    }

    pub fn with_on_download_end(mut self, command: impl Into<String>) -> Self {
        self.on_download_end = Some(command.into());
        self
    }

    /// Check if any hooks are defined.
    pub fn has_any(&self) -> bool {
        self.on_download_start.is_some() || self.on_download_end.is_some()
    }

    fn run(command: &str, target_key: &str, dir: &Path, finished: Option<bool>) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("LIVECAP_TARGET", target_key)
            .env("LIVECAP_DIR", dir);
        if let Some(finished) = finished {
            cmd.env("LIVECAP_FINISHED", if finished { "1" } else { "0" });
        }

        let status = cmd.status()?;
        if !status.success() {
            return Err(crate::Error::Other(format!(
                "hook command exited with {}",
                status
            )));
        }
        Ok(())
    }
}

impl LifecycleHooks for CommandHooks {
    fn started_download(&self, target_key: &str, dir: &Path) -> Result<()> {
        match &self.on_download_start {
            Some(command) => Self::run(command, target_key, dir, None),
            None => Ok(()),
        }
    }

    fn post_download(&self, target_key: &str, dir: &Path, finished: bool) -> Result<()> {
        match &self.on_download_end {
            Some(command) => Self::run(command, target_key, dir, Some(finished)),
            None => Ok(()),
        }
    }
}

/// Invoke the start hook, swallowing errors and panics.
pub(crate) fn run_started_hook(hooks: &Arc<dyn LifecycleHooks>, target_key: &str, dir: &Path) {
    let outcome = catch_unwind(AssertUnwindSafe(|| hooks.started_download(target_key, dir)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(target_key, "Started download hook error: {}", e),
        Err(_) => error!(target_key, "Started download hook panicked"),
    }
}

/// Invoke the end hook, swallowing errors and panics.
pub(crate) fn run_post_hook(
    hooks: &Arc<dyn LifecycleHooks>,
    target_key: &str,
    dir: &Path,
    finished: bool,
) {
    info!(target_key, finished, "Recording ended");
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        hooks.post_download(target_key, dir, finished)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(target_key, "Post download hook error: {}", e),
        Err(_) => error!(target_key, "Post download hook panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PanickyHooks;

    impl LifecycleHooks for PanickyHooks {
        fn started_download(&self, _: &str, _: &Path) -> Result<()> {
            panic!("user hook bug")
        }

        fn post_download(&self, _: &str, _: &Path, _: bool) -> Result<()> {
            Err(crate::Error::Other("hook failed".into()))
        }
    }

    #[test]
    fn hook_panics_and_errors_are_contained() {
        let hooks: Arc<dyn LifecycleHooks> = Arc::new(PanickyHooks);
        run_started_hook(&hooks, "v1", Path::new("/tmp"));
        run_post_hook(&hooks, "v1", Path::new("/tmp"), false);
    }

    #[test]
    fn command_hooks_builder() {
        let hooks = CommandHooks::new().with_on_download_start("true");
        assert!(hooks.has_any());
        assert!(hooks.on_download_end.is_none());
    }

    #[test]
    fn command_hooks_env_contract() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let hooks = CommandHooks::new().with_on_download_end(format!(
            "echo \"$LIVECAP_TARGET $LIVECAP_FINISHED\" > {}",
            marker.display()
        ));

        hooks.post_download("room-7", dir.path(), true).unwrap();
        let contents = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(contents.trim(), "room-7 1");
    }

    #[test]
    fn counting_hooks_observe_every_edge() {
        struct CountingHooks {
            started: AtomicUsize,
            ended: AtomicUsize,
        }

        impl LifecycleHooks for CountingHooks {
            fn started_download(&self, _: &str, _: &Path) -> Result<()> {
                self.started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn post_download(&self, _: &str, _: &Path, _: bool) -> Result<()> {
                self.ended.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let hooks = Arc::new(CountingHooks {
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let dynamic: Arc<dyn LifecycleHooks> = hooks.clone();
        run_started_hook(&dynamic, "v1", Path::new("/tmp"));
        run_post_hook(&dynamic, "v1", Path::new("/tmp"), true);
        assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
    }
}
