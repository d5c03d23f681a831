use anyhow::Result;
use tracing::warn;

use crate::stats::Metrics;

/// Receives one `(backend, stat)` pair per call while status is collected.
///
/// An `Err` means the backend could not produce that stat; the console
/// logs and skips it.
pub type StatusWriter<'w> = dyn FnMut(&str, Result<(&str, i64)>) + 'w;

/// A publishing backend subscribed to the bus.
pub trait Backend: Send {
    /// Returns the backend's name for logging and status lines.
    fn name(&self) -> &str;

    /// Called once per flush cycle with the derived metrics.
    ///
    /// Network I/O must not block the caller; spawn it instead.
    fn on_flush(&mut self, timestamp: u64, metrics: &Metrics<'_>) -> Result<()>;

    /// Reports backend statistics to the console `stats` command.
    fn on_status(&self, write: &mut StatusWriter<'_>);
}

/// Publish/subscribe hub connecting the flush cycle and the console to
/// the loaded backends.
///
/// Subscriptions happen at startup only. Delivery is synchronous and in
/// subscription order.
#[derive(Default)]
pub struct Bus {
    backends: Vec<Box<dyn Backend>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend to both the `flush` and `status` channels.
    pub fn subscribe(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Number of subscribed backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Names of subscribed backends in subscription order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.name())
    }

    /// Delivers a flush to every backend exactly once.
    ///
    /// A failing backend is logged and does not stop delivery to the
    /// rest. Returns the names of the backends that failed.
    pub fn publish_flush(&mut self, timestamp: u64, metrics: &Metrics<'_>) -> Vec<String> {
        let mut failed = Vec::new();

        for backend in &mut self.backends {
            if let Err(e) = backend.on_flush(timestamp, metrics) {
                warn!(backend = backend.name(), error = %e, "backend flush failed");
                failed.push(backend.name().to_string());
            }
        }

        failed
    }

    /// Collects status from every backend in subscription order.
    pub fn publish_status(&self, write: &mut StatusWriter<'_>) {
        for backend in &self.backends {
            backend.on_status(write);
        }
    }
}
