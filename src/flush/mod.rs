use std::time::{Duration, Instant};

use tracing::debug;

use crate::bus::Bus;
use crate::config::Config;
use crate::stats::{MetricsProcessor, StandardProcessor};
use crate::store::{ResetPolicy, Store};

/// Result of one flush cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSummary {
    pub timestamp: u64,
    pub duration: Duration,
    /// Backends whose `on_flush` returned an error.
    pub failed_backends: Vec<String>,
}

/// Runs the snapshot, derive, publish and reset cycle.
///
/// The scheduler holds no timer itself; the worker calls [`flush`] on
/// every tick of an interval of [`interval`].
///
/// [`flush`]: FlushScheduler::flush
/// [`interval`]: FlushScheduler::interval
pub struct FlushScheduler {
    interval: Duration,
    policy: ResetPolicy,
    processor: Box<dyn MetricsProcessor>,
}

impl FlushScheduler {
    pub fn new(interval: Duration, policy: ResetPolicy, processor: Box<dyn MetricsProcessor>) -> Self {
        Self {
            interval,
            policy,
            processor,
        }
    }

    /// Scheduler with the standard statistics processor.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.flush_interval,
            ResetPolicy::from_config(cfg),
            Box::new(StandardProcessor::new(cfg.percent_thresholds())),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> &ResetPolicy {
        &self.policy
    }

    /// Flushes the store to every backend, then applies the reset policy.
    ///
    /// Backend failures are already logged by the bus and never prevent
    /// the reset.
    pub fn flush(&self, store: &mut Store, bus: &mut Bus, timestamp: u64) -> FlushSummary {
        let started = Instant::now();

        let failed_backends = {
            let metrics = self
                .processor
                .process(store.snapshot(), self.interval, timestamp);
            bus.publish_flush(timestamp, &metrics)
        };

        store.reset(&self.policy);

        let duration = started.elapsed();
        debug!(
            timestamp,
            duration_ms = duration.as_millis() as u64,
            failed = failed_backends.len(),
            "flush complete",
        );

        FlushSummary {
            timestamp,
            duration,
            failed_backends,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    use super::*;
    use crate::bus::{Backend, StatusWriter};
    use crate::stats::Metrics;

    #[derive(Default)]
    struct Captured {
        counters: HashMap<String, f64>,
        rates: HashMap<String, f64>,
        timer_counts: HashMap<String, f64>,
        gauges: HashMap<String, f64>,
        set_sizes: HashMap<String, usize>,
        timestamps: Vec<u64>,
    }

    struct Capture {
        out: Arc<Mutex<Captured>>,
        fail: bool,
    }

    impl Backend for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn on_flush(&mut self, timestamp: u64, metrics: &Metrics<'_>) -> Result<()> {
            let mut out = self.out.lock();
            out.counters = metrics.counters.clone();
            out.rates = metrics.counter_rates.clone();
            out.timer_counts = metrics
                .timer_data
                .iter()
                .map(|(k, v)| (k.clone(), v["count"]))
                .collect();
            out.gauges = metrics.gauges.clone();
            out.set_sizes = metrics
                .sets
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect();
            out.timestamps.push(timestamp);
            if self.fail {
                bail!("refused");
            }
            Ok(())
        }

        fn on_status(&self, _write: &mut StatusWriter<'_>) {}
    }

    fn setup(fail: bool, policy: ResetPolicy) -> (FlushScheduler, Bus, Arc<Mutex<Captured>>) {
        let out = Arc::new(Mutex::new(Captured::default()));
        let mut bus = Bus::new();
        bus.subscribe(Box::new(Capture {
            out: Arc::clone(&out),
            fail,
        }));
        let scheduler = FlushScheduler::new(
            Duration::from_secs(10),
            policy,
            Box::new(StandardProcessor::new(vec![90.0])),
        );
        (scheduler, bus, out)
    }

    #[test]
    fn test_flush_publishes_then_resets() {
        let (scheduler, mut bus, out) = setup(false, ResetPolicy::default());
        let mut store = Store::new("statsd", 0);
        store.ingest("foo:1|c\nbar:320|ms\nbaz:1|s", 5, |_| {});

        let summary = scheduler.flush(&mut store, &mut bus, 1_000);
        assert!(summary.failed_backends.is_empty());
        assert_eq!(summary.timestamp, 1_000);

        {
            let out = out.lock();
            assert_eq!(out.counters.get("foo"), Some(&1.0));
            assert_eq!(out.rates.get("foo"), Some(&0.1));
            assert_eq!(out.timer_counts.get("bar"), Some(&1.0));
            assert_eq!(out.set_sizes.get("baz"), Some(&1));
            assert_eq!(out.counters.get("statsd.packets_received"), Some(&1.0));
            assert_eq!(out.timestamps, vec![1_000]);
        }

        assert_eq!(store.counters().get("foo"), Some(&0.0));
        assert_eq!(store.timers().get("bar"), Some(&Vec::new()));
        assert_eq!(store.sets().get("baz").map(|s| s.len()), Some(0));
    }

    #[test]
    fn test_gauge_survives_flush() {
        let (scheduler, mut bus, out) = setup(false, ResetPolicy::default());
        let mut store = Store::new("statsd", 0);
        store.ingest("temp:21|g", 0, |_| {});

        scheduler.flush(&mut store, &mut bus, 1);
        scheduler.flush(&mut store, &mut bus, 2);

        assert_eq!(out.lock().gauges.get("temp"), Some(&21.0));
        assert_eq!(out.lock().timestamps, vec![1, 2]);
    }

    #[test]
    fn test_empty_timer_reported_after_reset() {
        let (scheduler, mut bus, out) = setup(false, ResetPolicy::default());
        let mut store = Store::new("statsd", 0);
        store.ingest("lat:5|ms", 0, |_| {});

        scheduler.flush(&mut store, &mut bus, 1);
        scheduler.flush(&mut store, &mut bus, 2);

        assert_eq!(out.lock().timer_counts.get("lat"), Some(&0.0));
    }

    #[test]
    fn test_backend_error_does_not_stop_reset() {
        let (scheduler, mut bus, _out) = setup(true, ResetPolicy::delete_all());
        let mut store = Store::new("statsd", 0);
        store.ingest("foo:1|c", 0, |_| {});

        let summary = scheduler.flush(&mut store, &mut bus, 1);
        assert_eq!(summary.failed_backends, vec!["capture".to_string()]);
        assert!(store.counters().is_empty());
    }

    #[test]
    fn test_from_config_resolves_policy() {
        let cfg = Config {
            delete_idle_stats: true,
            delete_gauges: Some(false),
            ..Default::default()
        };
        let scheduler = FlushScheduler::from_config(&cfg);
        assert_eq!(scheduler.interval(), Duration::from_secs(10));
        assert!(scheduler.policy().delete_counters);
        assert!(!scheduler.policy().delete_gauges);
    }
}
