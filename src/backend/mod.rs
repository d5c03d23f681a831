pub mod console;
pub mod graphite;

use anyhow::{bail, Result};
use tracing::info;

use crate::bus::Bus;
use crate::config::Config;

use self::console::ConsoleBackend;
use self::graphite::GraphiteBackend;

/// Backend names accepted in the `backends` config list.
pub const KNOWN_BACKENDS: &[&str] = &["graphite", "console"];

/// Constructs the named backend from configuration and subscribes it.
///
/// Any failure is fatal to startup.
pub fn load(name: &str, startup_time: u64, cfg: &Config, bus: &mut Bus) -> Result<()> {
    match name {
        "graphite" => {
            let backend = GraphiteBackend::new(&cfg.graphite, &cfg.prefix_stats, startup_time);
            info!(
                host = cfg.graphite.host.as_deref().unwrap_or("<unset>"),
                port = cfg.graphite.port,
                legacy_namespace = cfg.graphite.legacy_namespace,
                "graphite backend loaded",
            );
            bus.subscribe(Box::new(backend));
        }
        "console" => {
            bus.subscribe(Box::new(ConsoleBackend::new(startup_time)));
            info!("console backend loaded");
        }
        other => bail!("unknown backend: {other}"),
    }

    Ok(())
}
