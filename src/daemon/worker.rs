use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::console::{self, ConsoleRequest, ConsoleState};
use crate::export::health::HealthMetrics;
use crate::flush::FlushScheduler;
use crate::sampler::{self, KeySampler};
use crate::store::Store;

use super::unix_now;

/// Periodic tasks besides the flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct Schedules {
    /// Key activity report period, when the sampler is enabled.
    pub key_flush: Option<Duration>,
    /// Bucket dump period, when debug is enabled.
    pub debug_dump: Option<Duration>,
}

/// The single task owning every piece of aggregation state.
///
/// Datagrams, console commands and ticks are handled one at a time, so a
/// flush never interleaves with a sample.
pub struct Worker {
    store: Store,
    bus: Bus,
    scheduler: FlushScheduler,
    sampler: Option<KeySampler>,
    schedules: Schedules,
    health: Arc<HealthMetrics>,
    startup_time: u64,
    dump_messages: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Bus,
        scheduler: FlushScheduler,
        sampler: Option<KeySampler>,
        schedules: Schedules,
        health: Arc<HealthMetrics>,
        startup_time: u64,
        dump_messages: bool,
    ) -> Self {
        Self {
            store,
            bus,
            scheduler,
            sampler,
            schedules,
            health,
            startup_time,
            dump_messages,
        }
    }

    /// Runs until cancelled. No final flush is performed.
    pub async fn run(
        mut self,
        mut packets: mpsc::Receiver<Vec<u8>>,
        mut requests: mpsc::Receiver<ConsoleRequest>,
        cancel: CancellationToken,
    ) {
        let mut flush_ticker = ticker(self.scheduler.interval());
        let mut key_ticker = self.schedules.key_flush.map(ticker);
        let mut debug_ticker = self.schedules.debug_dump.map(ticker);

        info!(
            flush_interval_ms = self.scheduler.interval().as_millis() as u64,
            backends = self.bus.len(),
            "aggregation worker started",
        );

        loop {
            // Ticks, then console requests, then packets: a steady packet
            // stream can delay neither a flush nor an operator command.
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = flush_ticker.tick() => self.flush(),

                _ = tick(&mut key_ticker) => self.report_keys(),

                _ = tick(&mut debug_ticker) => self.dump_buckets(),

                Some(request) = requests.recv() => self.handle_console(request),

                Some(packet) = packets.recv() => self.handle_packet(&packet),
            }
        }

        debug!("aggregation worker stopped");
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        let payload = String::from_utf8_lossy(packet);
        self.health.packets_received.inc();

        let dump_messages = self.dump_messages;
        let keys = &mut self.sampler;
        let summary = self.store.ingest(&payload, unix_now(), |line| {
            if dump_messages {
                info!(line = line.raw(), "metric line");
            }
            if let Some(keys) = keys.as_mut() {
                keys.record(line.key());
            }
        });

        if summary.bad_lines > 0 {
            self.health.bad_lines.inc_by(summary.bad_lines as f64);
        }
    }

    fn handle_console(&mut self, request: ConsoleRequest) {
        let response = console::execute(
            &request.command,
            ConsoleState {
                store: &mut self.store,
                bus: &self.bus,
                startup_time: self.startup_time,
                now: unix_now(),
            },
        );

        // The connection may have closed while waiting.
        let _ = request.reply.send(response);
    }

    fn flush(&mut self) {
        let summary = self
            .scheduler
            .flush(&mut self.store, &mut self.bus, unix_now());

        self.health.flushes.inc();
        self.health
            .flush_duration
            .observe(summary.duration.as_secs_f64());
        for backend in &summary.failed_backends {
            self.health
                .backend_errors
                .with_label_values(&[backend.as_str()])
                .inc();
        }
        self.health.observe_buckets(&self.store);
    }

    fn report_keys(&mut self) {
        let Some(keys) = self.sampler.as_mut() else {
            return;
        };

        let report = keys.take_report(Utc::now());
        let output = keys.output().clone();
        tokio::spawn(async move {
            if let Err(e) = sampler::write_report(&output, &report).await {
                warn!(error = %e, "writing key activity report");
            }
        });
    }

    fn dump_buckets(&self) {
        debug!(counters = ?self.store.counters(), "counters");
        debug!(timers = ?self.store.timers(), "timers");
        debug!(sets = ?self.store.sets(), "sets");
        debug!(gauges = ?self.store.gauges(), "gauges");
    }
}

/// Interval whose first tick fires one full period from now.
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Ticks an optional interval; never completes when absent.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
