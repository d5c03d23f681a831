use anyhow::Result;
use tracing::info;

use crate::bus::{Backend, StatusWriter};
use crate::stats::Metrics;

/// Logs a summary of every flush. Intended for local debugging.
#[derive(Debug, Default)]
pub struct ConsoleBackend {
    last_flush: i64,
    flushes: i64,
}

impl ConsoleBackend {
    pub fn new(startup_time: u64) -> Self {
        Self {
            last_flush: i64::try_from(startup_time).unwrap_or(i64::MAX),
            flushes: 0,
        }
    }
}

impl Backend for ConsoleBackend {
    fn name(&self) -> &str {
        "console"
    }

    fn on_flush(&mut self, timestamp: u64, metrics: &Metrics<'_>) -> Result<()> {
        let timer_samples: usize = metrics.timers.values().map(Vec::len).sum();

        info!(
            timestamp,
            counters = metrics.counters.len(),
            timers = metrics.timers.len(),
            timer_samples,
            gauges = metrics.gauges.len(),
            sets = metrics.sets.len(),
            "flush",
        );

        for (key, value) in metrics.counters {
            let rate = metrics.counter_rates.get(key).copied().unwrap_or_default();
            info!(key = %key, value, rate, "counter");
        }
        for (key, value) in metrics.gauges {
            info!(key = %key, value, "gauge");
        }
        for (key, members) in metrics.sets {
            info!(key = %key, count = members.len(), "set");
        }
        for (key, data) in &metrics.timer_data {
            info!(key = %key, stats = ?data, "timer");
        }

        self.last_flush = i64::try_from(timestamp).unwrap_or(i64::MAX);
        self.flushes += 1;
        Ok(())
    }

    fn on_status(&self, write: &mut StatusWriter<'_>) {
        write(self.name(), Ok(("last_flush", self.last_flush)));
        write(self.name(), Ok(("flushes", self.flushes)));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stats::{MetricsProcessor, StandardProcessor};
    use crate::store::Store;

    #[test]
    fn test_flush_updates_status() {
        let mut backend = ConsoleBackend::new(10);
        let mut store = Store::new("statsd", 0);
        store.ingest("a:1|c\nb:2|ms", 0, |_| {});
        let metrics = StandardProcessor::new(vec![90.0]).process(
            store.snapshot(),
            Duration::from_secs(1),
            20,
        );

        backend.on_flush(20, &metrics).expect("flush");

        let mut seen = Vec::new();
        backend.on_status(&mut |name, stat| {
            if let Ok((stat, value)) = stat {
                seen.push((format!("{name}.{stat}"), value));
            }
        });
        assert_eq!(
            seen,
            vec![
                ("console.last_flush".to_string(), 20),
                ("console.flushes".to_string(), 1)
            ]
        );
    }
}
