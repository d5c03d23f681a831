//! Graphite plaintext protocol backend.
//!
//! Each flush is rendered into `<path> <value> <timestamp>\n` lines and
//! written over a fresh TCP connection on a spawned task, so the flush
//! cycle never waits on carbon.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::bus::{Backend, StatusWriter};
use crate::config::GraphiteConfig;
use crate::stats::Metrics;

/// Metric path segments per bucket type.
#[derive(Debug, Clone, PartialEq)]
pub struct Namespaces {
    legacy: bool,
    global: Vec<String>,
    counter: Vec<String>,
    timer: Vec<String>,
    gauge: Vec<String>,
    set: Vec<String>,
    suffixes: Option<Suffixes>,
}

#[derive(Debug, Clone, PartialEq)]
struct Suffixes {
    counter: String,
    timer: String,
    gauge: String,
    set: String,
}

impl Namespaces {
    pub fn from_config(cfg: &GraphiteConfig) -> Self {
        let suffixes = cfg.use_suffix_names.then(|| Suffixes {
            counter: cfg.suffix_counter.clone(),
            timer: cfg.suffix_timer.clone(),
            gauge: cfg.suffix_gauge.clone(),
            set: cfg.suffix_set.clone(),
        });

        if cfg.legacy_namespace {
            let stats = || vec!["stats".to_string()];
            let nested = |segment: &str| vec!["stats".to_string(), segment.to_string()];
            return Self {
                legacy: true,
                global: stats(),
                counter: stats(),
                timer: nested("timers"),
                gauge: nested("gauges"),
                set: nested("sets"),
                suffixes,
            };
        }

        let global: Vec<String> = if cfg.global_prefix.is_empty() {
            Vec::new()
        } else {
            vec![cfg.global_prefix.clone()]
        };

        // Type prefixes only apply when suffixes are off.
        let typed = |prefix: &str| {
            let mut ns = global.clone();
            if suffixes.is_none() && !prefix.is_empty() {
                ns.push(prefix.to_string());
            }
            ns
        };

        Self {
            legacy: false,
            counter: typed(&cfg.prefix_counter),
            timer: typed(&cfg.prefix_timer),
            gauge: typed(&cfg.prefix_gauge),
            set: typed(&cfg.prefix_set),
            global,
            suffixes,
        }
    }

    fn path(base: &[String], key: &str, suffix: Option<&str>) -> String {
        let mut path = String::new();
        for segment in base {
            path.push_str(segment);
            path.push('.');
        }
        path.push_str(key);
        if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
            path.push('.');
            path.push_str(suffix);
        }
        path
    }

    fn counter_path(&self, key: &str) -> String {
        Self::path(&self.counter, key, self.suffixes.as_ref().map(|s| s.counter.as_str()))
    }

    fn timer_path(&self, key: &str) -> String {
        Self::path(&self.timer, key, self.suffixes.as_ref().map(|s| s.timer.as_str()))
    }

    fn gauge_path(&self, key: &str) -> String {
        Self::path(&self.gauge, key, self.suffixes.as_ref().map(|s| s.gauge.as_str()))
    }

    fn set_path(&self, key: &str) -> String {
        Self::path(&self.set, key, self.suffixes.as_ref().map(|s| s.set.as_str()))
    }

    /// Namespace of the daemon's own lines: global segments plus `prefix_stats`.
    fn daemon_path(&self, prefix_stats: &str) -> String {
        Self::path(&self.global, prefix_stats, None)
    }
}

/// Renders a flush into graphite plaintext lines.
pub fn format_payload(
    ns: &Namespaces,
    prefix_stats: &str,
    timestamp: u64,
    metrics: &Metrics<'_>,
) -> String {
    let started = Instant::now();
    let mut out = String::new();
    let mut num_stats = 0u64;

    // Writing to a String cannot fail.
    let line = |out: &mut String, path: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{path} {value} {timestamp}");
    };

    for (key, value) in sorted(metrics.counters) {
        let rate = metrics.counter_rates.get(key).copied().unwrap_or_default();
        let path = ns.counter_path(key);
        if ns.legacy {
            line(&mut out, &path, &rate);
            line(&mut out, &format!("stats_counts.{key}"), value);
        } else {
            line(&mut out, &format!("{path}.rate"), &rate);
            line(&mut out, &format!("{path}.count"), value);
        }
        num_stats += 1;
    }

    let mut timer_keys: Vec<&String> = metrics.timer_data.keys().collect();
    timer_keys.sort();
    for key in timer_keys {
        let path = ns.timer_path(key);
        for (stat, value) in &metrics.timer_data[key] {
            line(&mut out, &format!("{path}.{stat}"), value);
        }
        num_stats += 1;
    }

    for (key, value) in sorted(metrics.gauges) {
        line(&mut out, &ns.gauge_path(key), value);
        num_stats += 1;
    }

    for (key, members) in sorted(metrics.sets) {
        line(&mut out, &format!("{}.count", ns.set_path(key)), &members.len());
        num_stats += 1;
    }

    let daemon = ns.daemon_path(prefix_stats);
    let calculation_ms = started.elapsed().as_millis();
    if ns.legacy {
        line(&mut out, &format!("{prefix_stats}.numStats"), &num_stats);
        line(
            &mut out,
            &format!("stats.{prefix_stats}.graphiteStats.calculationtime"),
            &calculation_ms,
        );
        for (key, value) in &metrics.statsd_metrics {
            line(&mut out, &format!("stats.{prefix_stats}.{key}"), value);
        }
    } else {
        line(&mut out, &format!("{daemon}.numStats"), &num_stats);
        line(
            &mut out,
            &format!("{daemon}.graphiteStats.calculationtime"),
            &calculation_ms,
        );
        for (key, value) in &metrics.statsd_metrics {
            line(&mut out, &format!("{daemon}.{key}"), value);
        }
    }

    out
}

fn sorted<V>(map: &std::collections::HashMap<String, V>) -> Vec<(&String, &V)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Timestamps of the last successful send and the last failure.
#[derive(Debug)]
pub struct GraphiteStats {
    last_flush: AtomicI64,
    last_exception: AtomicI64,
}

impl GraphiteStats {
    fn new(startup_time: i64) -> Self {
        Self {
            last_flush: AtomicI64::new(startup_time),
            last_exception: AtomicI64::new(startup_time),
        }
    }

    pub fn last_flush(&self) -> i64 {
        self.last_flush.load(Ordering::Relaxed)
    }

    pub fn last_exception(&self) -> i64 {
        self.last_exception.load(Ordering::Relaxed)
    }
}

/// Backend shipping flushes to a carbon plaintext listener.
pub struct GraphiteBackend {
    target: Option<String>,
    namespaces: Namespaces,
    prefix_stats: String,
    stats: Arc<GraphiteStats>,
}

impl GraphiteBackend {
    pub fn new(cfg: &GraphiteConfig, prefix_stats: &str, startup_time: u64) -> Self {
        let target = cfg.host.as_ref().map(|host| {
            if host.contains(':') {
                format!("[{host}]:{}", cfg.port)
            } else {
                format!("{host}:{}", cfg.port)
            }
        });

        Self {
            target,
            namespaces: Namespaces::from_config(cfg),
            prefix_stats: prefix_stats.to_string(),
            stats: Arc::new(GraphiteStats::new(
                i64::try_from(startup_time).unwrap_or(i64::MAX),
            )),
        }
    }

    /// Shared send statistics.
    pub fn stats(&self) -> Arc<GraphiteStats> {
        Arc::clone(&self.stats)
    }
}

impl Backend for GraphiteBackend {
    fn name(&self) -> &str {
        "graphite"
    }

    fn on_flush(&mut self, timestamp: u64, metrics: &Metrics<'_>) -> Result<()> {
        let payload = format_payload(&self.namespaces, &self.prefix_stats, timestamp, metrics);

        let Some(target) = self.target.clone() else {
            debug!("graphite host not configured, skipping send");
            return Ok(());
        };

        let runtime = tokio::runtime::Handle::try_current()
            .context("graphite send requires a tokio runtime")?;

        let daemon = self.namespaces.daemon_path(&self.prefix_stats);
        let stats = Arc::clone(&self.stats);
        runtime.spawn(async move {
            if let Err(e) = send(&target, &daemon, payload, &stats).await {
                debug!(target = %target, error = %e, "graphite send failed");
                stats
                    .last_exception
                    .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
            }
        });

        Ok(())
    }

    fn on_status(&self, write: &mut StatusWriter<'_>) {
        write(self.name(), Ok(("last_flush", self.stats.last_flush())));
        write(self.name(), Ok(("last_exception", self.stats.last_exception())));
    }
}

async fn send(target: &str, daemon: &str, mut payload: String, stats: &GraphiteStats) -> Result<()> {
    let last_flush = stats.last_flush();
    let last_exception = stats.last_exception();

    let mut stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("connecting to {target}"))?;

    let ts = chrono::Utc::now().timestamp();
    let _ = writeln!(payload, "{daemon}.graphiteStats.last_exception {last_exception} {ts}");
    let _ = writeln!(payload, "{daemon}.graphiteStats.last_flush {last_flush} {ts}");

    stream
        .write_all(payload.as_bytes())
        .await
        .context("writing graphite payload")?;
    stream.shutdown().await.context("closing graphite connection")?;

    stats
        .last_flush
        .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);

    Ok(())
}
