pub mod listener;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend;
use crate::bus::{Backend, Bus};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::flush::FlushScheduler;
use crate::sampler::KeySampler;
use crate::store::Store;

use self::worker::{Schedules, Worker};

/// Datagrams queued between the UDP listener and the worker.
const PACKET_QUEUE: usize = 4096;

/// Console commands queued for the worker.
const CONSOLE_QUEUE: usize = 64;

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Daemon wires the listeners, the aggregation worker and the backends.
pub struct Daemon {
    cfg: Config,
    health: Arc<HealthMetrics>,
    startup_time: u64,
    extra_backends: Vec<Box<dyn Backend>>,
    udp_addr: Option<SocketAddr>,
    console_addr: Option<SocketAddr>,
    health_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Creates a new Daemon, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            startup_time: unix_now(),
            extra_backends: Vec::new(),
            udp_addr: None,
            console_addr: None,
            health_addr: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribes a backend in addition to the configured ones.
    ///
    /// Must be called before [`start`](Daemon::start).
    pub fn add_backend(&mut self, backend: Box<dyn Backend>) {
        self.extra_backends.push(backend);
    }

    /// Loads backends, binds both listeners and spawns the worker.
    ///
    /// Fails without serving traffic if any backend or socket cannot be set up.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health metrics server.
        if self.cfg.health.enabled {
            let addr = self
                .health
                .start()
                .await
                .context("starting health metrics server")?;
            self.health_addr = Some(addr);
        }

        if let Err(e) = self.start_pipeline().await {
            self.health.stop();
            self.health_addr = None;
            return Err(e);
        }

        Ok(())
    }

    /// Backends, listeners and the worker. Nothing is spawned on failure.
    async fn start_pipeline(&mut self) -> Result<()> {
        // 2. Backends, in configuration order.
        let mut bus = Bus::new();
        for name in &self.cfg.backends {
            backend::load(name, self.startup_time, &self.cfg, &mut bus)
                .with_context(|| format!("loading backend {name}"))?;
        }
        for extra in self.extra_backends.drain(..) {
            info!(backend = extra.name(), "backend added");
            bus.subscribe(extra);
        }

        // 3. Listeners.
        let udp_bind = self.cfg.server.bind_addr();
        let socket = UdpSocket::bind(&udp_bind)
            .await
            .with_context(|| format!("binding UDP listener on {udp_bind}"))?;
        let udp_addr = socket.local_addr().context("getting UDP local address")?;

        let mgmt_bind = self.cfg.mgmt.bind_addr();
        let mgmt = TcpListener::bind(&mgmt_bind)
            .await
            .with_context(|| format!("binding console listener on {mgmt_bind}"))?;
        let console_addr = mgmt.local_addr().context("getting console local address")?;

        // 4. Worker owning all aggregation state.
        let sampler = self
            .cfg
            .key_flush_enabled()
            .then(|| KeySampler::from_config(&self.cfg.key_flush));
        let schedules = Schedules {
            key_flush: self
                .cfg
                .key_flush_enabled()
                .then_some(self.cfg.key_flush.interval),
            debug_dump: self.cfg.debug.then_some(self.cfg.debug_interval),
        };
        let worker = Worker::new(
            Store::new(&self.cfg.prefix_stats, self.startup_time),
            bus,
            FlushScheduler::from_config(&self.cfg),
            sampler,
            schedules,
            Arc::clone(&self.health),
            self.startup_time,
            self.cfg.dump_messages,
        );

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let (console_tx, console_rx) = mpsc::channel(CONSOLE_QUEUE);

        self.tasks.push(tokio::spawn(worker.run(
            packet_rx,
            console_rx,
            self.cancel.child_token(),
        )));
        self.tasks.push(tokio::spawn(listener::run_udp(
            socket,
            packet_tx,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )));
        self.tasks.push(tokio::spawn(crate::console::serve(
            mgmt,
            console_tx,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )));

        self.udp_addr = Some(udp_addr);
        self.console_addr = Some(console_addr);

        info!(
            udp = %udp_addr,
            console = %console_addr,
            flush_interval_ms = self.cfg.flush_interval.as_millis() as u64,
            "server is up",
        );

        Ok(())
    }

    /// Stops listeners and the worker. Pending samples are not flushed.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "daemon task failed");
            }
        }

        self.health.stop();

        Ok(())
    }

    /// Bound UDP address, once started.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Bound console address, once started.
    pub fn console_addr(&self) -> Option<SocketAddr> {
        self.console_addr
    }

    /// Bound health server address, when enabled and started.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }
}
