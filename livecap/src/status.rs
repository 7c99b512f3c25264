//! Process-wide status registry and periodic report printer.
//!
//! Watchers register as [`StatusSource`]s; the printer walks every source,
//! renders the nested line tree with two-space indentation, and frames the
//! report with banners. The registry holds weak references only, so a
//! watcher that is dropped disappears from the report.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One node of a status report: a line, or a nested group printed one
/// indentation level deeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusNode {
    Line(String),
    Group(Vec<StatusNode>),
}

impl StatusNode {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line(text.into())
    }
}

/// A watcher that contributes lines to the status report.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> Vec<StatusNode>;
}

/// Process-wide collection of status sources.
pub struct StatusRegistry {
    sources: Mutex<Vec<Weak<dyn StatusSource>>>,
}

static REGISTRY: OnceLock<StatusRegistry> = OnceLock::new();

impl StatusRegistry {
    fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static StatusRegistry {
        REGISTRY.get_or_init(StatusRegistry::new)
    }

    /// Register a source. Only a weak reference is retained.
    pub fn register(&self, source: Weak<dyn StatusSource>) {
        self.sources.lock().push(source);
    }

    /// Remove a previously registered source.
    pub fn unregister(&self, source: &Arc<dyn StatusSource>) {
        self.sources
            .lock()
            .retain(|w| !w.ptr_eq(&Arc::downgrade(source)));
    }

    /// Render the current report as indented lines, pruning dead sources.
    pub fn render(&self) -> Vec<String> {
        let sources: Vec<Arc<dyn StatusSource>> = {
            let mut guard = self.sources.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };

        let mut lines = vec![format!("Report Time: {}", chrono::Local::now())];
        for source in sources {
            render_nodes(&source.status(), 0, &mut lines);
        }
        lines
    }

    /// Print one banner-framed report through the logging layer.
    pub fn print(&self) {
        info!(" ===== STATUS REPORT =====");
        for line in self.render() {
            info!("[status] {}", line);
        }
        info!(" ===== END STATUS REPORT =====");
    }
}

fn render_nodes(nodes: &[StatusNode], depth: usize, out: &mut Vec<String>) {
    for node in nodes {
        match node {
            StatusNode::Line(text) => out.push(format!("{}{}", "  ".repeat(depth), text)),
            StatusNode::Group(children) => render_nodes(children, depth + 1, out),
        }
    }
}

/// Periodically print the status report until shutdown; a final report is
/// printed when the shutdown signal fires.
pub async fn run_printer(interval: Duration, shutdown: CancellationToken) {
    let registry = StatusRegistry::global();
    registry.print();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => registry.print(),
            _ = shutdown.cancelled() => {
                registry.print();
                return;
            }
        }
    }
}
