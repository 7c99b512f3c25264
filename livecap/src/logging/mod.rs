//! Logging initialisation.
//!
//! Console output plus a non-blocking daily log file, with local-timezone
//! timestamps and an `EnvFilter`-controlled level.

use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::Result;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "livecap=info,chatframe=info";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initialise the global tracing subscriber.
///
/// The returned guard must be kept alive for the process lifetime; dropping
/// it stops the background log writer.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_appender = tracing_appender::rolling::daily(log_dir.as_ref(), "livecap.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer().with_timer(LocalTimer).with_target(true);

    let file_layer = fmt::layer()
        .with_timer(LocalTimer)
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to initialise logging: {}", e)))?;

    Ok(guard)
}
