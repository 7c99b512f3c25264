//! Child-process supervision shared by the external extractor backends.
//!
//! The supervisor task maps the handle contract onto a child process:
//! interrupt closes the child's stdin (its native cancellation channel) and
//! allows a bounded grace period before killing; kill is immediate; success
//! is a zero exit code plus an optional artifact check.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tracing::{debug, error, warn};

use super::HandleDriver;

/// Post-exit check that the expected output actually exists.
pub(crate) type ArtifactCheck = Box<dyn Fn() -> bool + Send>;

/// Spawn the supervision task for a child process.
pub(crate) fn supervise(
    mut child: Child,
    driver: HandleDriver,
    grace: Duration,
    artifact_check: Option<ArtifactCheck>,
) {
    // Hold the child's stdin open; dropping it is the interrupt request.
    let mut stdin = child.stdin.take();

    tokio::spawn(async move {
        let exited_zero = tokio::select! {
            _ = driver.kill.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                false
            }
            _ = driver.interrupt.cancelled() => {
                drop(stdin.take());
                let waited = tokio::select! {
                    _ = driver.kill.cancelled() => None,
                    res = tokio::time::timeout(grace, child.wait()) => res.ok(),
                };
                match waited {
                    Some(Ok(status)) => status.success(),
                    _ => {
                        warn!("Downloader ignored interrupt; killing process");
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        false
                    }
                }
            }
            status = child.wait() => match status {
                Ok(status) => {
                    if !status.success() {
                        warn!("Downloader exited with {}", status);
                    }
                    status.success()
                }
                Err(e) => {
                    error!("Error waiting for downloader process: {}", e);
                    false
                }
            }
        };

        let success = exited_zero && artifact_check.as_ref().is_none_or(|check| check());
        driver.complete(success);
    });
}

/// Forward a child's stderr lines to the log at debug level.
pub(crate) fn log_stderr(tag: &'static str, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "livecap::downloader", "[{}] {}", tag, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::downloader::{DownloadHandle, DownloaderKind};
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_shell(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn shell")
    }

    #[tokio::test]
    async fn clean_exit_is_success() {
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(spawn_shell("exit 0"), driver, Duration::from_secs(1), None);
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(handle.finished());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(spawn_shell("exit 3"), driver, Duration::from_secs(1), None);
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(!handle.finished());
    }

    #[tokio::test]
    async fn interrupt_closes_stdin_for_cooperative_stop() {
        // `cat` exits 0 when its stdin closes.
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(spawn_shell("cat"), driver, Duration::from_secs(5), None);
        assert!(handle.is_running());

        handle.interrupt();
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(handle.finished());
    }

    #[tokio::test]
    async fn interrupt_escalates_to_kill_after_grace() {
        // Ignores stdin close entirely.
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(
            spawn_shell("exec 0<&-; sleep 600"),
            driver,
            Duration::from_millis(100),
            None,
        );
        handle.interrupt();
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(!handle.finished());
    }

    #[tokio::test]
    async fn kill_terminates_immediately() {
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Ytdlp);
        supervise(spawn_shell("sleep 600"), driver, Duration::from_secs(1), None);
        handle.kill();
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(!handle.finished());
    }

    #[tokio::test]
    async fn artifact_check_gates_success() {
        let (handle, driver) = DownloadHandle::new(DownloaderKind::Youget);
        supervise(
            spawn_shell("exit 0"),
            driver,
            Duration::from_secs(1),
            Some(Box::new(|| false)),
        );
        assert!(handle.wait(Some(Duration::from_secs(5))).await);
        assert!(!handle.finished());
    }
}
