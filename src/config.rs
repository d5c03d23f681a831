use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::backend::KNOWN_BACKENDS;

/// Top-level configuration for the tallyd daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// UDP listener for the metrics wire protocol.
    #[serde(default = "default_server")]
    pub server: BindConfig,

    /// TCP listener for the management console.
    #[serde(default = "default_mgmt")]
    pub mgmt: BindConfig,

    /// How often aggregated metrics are flushed to backends. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Timer percentile thresholds. Accepts a single number or a list. Default: 90.
    #[serde(default)]
    pub percent_threshold: PercentThreshold,

    /// Key activity sampling configuration.
    #[serde(default)]
    pub key_flush: KeyFlushConfig,

    /// Turns every unset `delete_*` flag on.
    #[serde(default)]
    pub delete_idle_stats: bool,

    /// Remove counters at flush instead of zeroing them.
    #[serde(default)]
    pub delete_counters: Option<bool>,

    /// Remove timers at flush instead of emptying them.
    #[serde(default)]
    pub delete_timers: Option<bool>,

    /// Remove sets at flush instead of emptying them.
    #[serde(default)]
    pub delete_sets: Option<bool>,

    /// Remove gauges at flush instead of keeping their last value.
    #[serde(default)]
    pub delete_gauges: Option<bool>,

    /// Verbose logging plus a periodic dump of all buckets.
    #[serde(default)]
    pub debug: bool,

    /// Interval of the debug bucket dump. Default: 10s.
    #[serde(default = "default_debug_interval", with = "humantime_serde")]
    pub debug_interval: Duration,

    /// Backends to load, in subscription order. Default: ["graphite"].
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,

    /// Prefix for the daemon's own counters. Default: "statsd".
    #[serde(default = "default_prefix_stats")]
    pub prefix_stats: String,

    /// Log every received metric line.
    #[serde(default)]
    pub dump_messages: bool,

    /// Graphite backend configuration.
    #[serde(default)]
    pub graphite: GraphiteConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Socket bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    /// Interface address. Default: "0.0.0.0".
    #[serde(default = "default_bind_address")]
    pub address: String,

    /// Port number.
    pub port: u16,
}

impl BindConfig {
    /// Returns the `address:port` string used for binding.
    pub fn bind_addr(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Percentile thresholds, written either as `90` or `[90, 99]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PercentThreshold {
    Single(f64),
    List(Vec<f64>),
}

impl Default for PercentThreshold {
    fn default() -> Self {
        Self::Single(90.0)
    }
}

impl PercentThreshold {
    /// Returns the thresholds as a list so single values work the same way.
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            Self::Single(pct) => vec![*pct],
            Self::List(pcts) => pcts.clone(),
        }
    }
}

/// Key activity sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyFlushConfig {
    /// Sampling period. Zero disables the sampler. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,

    /// Share of the busiest keys to report, in percent. Default: 100.
    #[serde(default = "default_key_flush_percent")]
    pub percent: f64,

    /// Append-mode log file. Stdout when unset.
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Graphite backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphiteConfig {
    /// Carbon host. Nothing is sent when unset.
    #[serde(default)]
    pub host: Option<String>,

    /// Carbon plaintext port. Default: 2003.
    #[serde(default = "default_graphite_port")]
    pub port: u16,

    /// Use the fixed `stats.*` namespaces. Default: true.
    #[serde(default = "default_true")]
    pub legacy_namespace: bool,

    /// Leading namespace segment outside legacy mode. Default: "stats".
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,

    #[serde(default = "default_counter_segment")]
    pub prefix_counter: String,

    #[serde(default = "default_timer_segment")]
    pub prefix_timer: String,

    #[serde(default = "default_gauge_segment")]
    pub prefix_gauge: String,

    #[serde(default = "default_set_segment")]
    pub prefix_set: String,

    /// Place the type segment after the key instead of before it.
    #[serde(default)]
    pub use_suffix_names: bool,

    #[serde(default = "default_counter_segment")]
    pub suffix_counter: String,

    #[serde(default = "default_timer_segment")]
    pub suffix_timer: String,

    #[serde(default = "default_gauge_segment")]
    pub suffix_gauge: String,

    #[serde(default = "default_set_segment")]
    pub suffix_set: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve the health endpoint. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9103".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server() -> BindConfig {
    BindConfig {
        address: default_bind_address(),
        port: 8125,
    }
}

fn default_mgmt() -> BindConfig {
    BindConfig {
        address: default_bind_address(),
        port: 8126,
    }
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(10_000)
}

fn default_debug_interval() -> Duration {
    Duration::from_millis(10_000)
}

fn default_key_flush_percent() -> f64 {
    100.0
}

fn default_backends() -> Vec<String> {
    vec!["graphite".to_string()]
}

fn default_prefix_stats() -> String {
    "statsd".to_string()
}

fn default_true() -> bool {
    true
}

fn default_graphite_port() -> u16 {
    2003
}

fn default_global_prefix() -> String {
    "stats".to_string()
}

fn default_counter_segment() -> String {
    "counters".to_string()
}

fn default_timer_segment() -> String {
    "timers".to_string()
}

fn default_gauge_segment() -> String {
    "gauges".to_string()
}

fn default_set_segment() -> String {
    "sets".to_string()
}

fn default_health_addr() -> String {
    ":9103".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: default_server(),
            mgmt: default_mgmt(),
            flush_interval: default_flush_interval(),
            percent_threshold: PercentThreshold::default(),
            key_flush: KeyFlushConfig::default(),
            delete_idle_stats: false,
            delete_counters: None,
            delete_timers: None,
            delete_sets: None,
            delete_gauges: None,
            debug: false,
            debug_interval: default_debug_interval(),
            backends: default_backends(),
            prefix_stats: default_prefix_stats(),
            dump_messages: false,
            graphite: GraphiteConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for KeyFlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            percent: default_key_flush_percent(),
            log: None,
        }
    }
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_graphite_port(),
            legacy_namespace: true,
            global_prefix: default_global_prefix(),
            prefix_counter: default_counter_segment(),
            prefix_timer: default_timer_segment(),
            prefix_gauge: default_gauge_segment(),
            prefix_set: default_set_segment(),
            use_suffix_names: false,
            suffix_counter: default_counter_segment(),
            suffix_timer: default_timer_segment(),
            suffix_gauge: default_gauge_segment(),
            suffix_set: default_set_segment(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.debug && self.debug_interval.is_zero() {
            bail!("debug_interval must be positive when debug is enabled");
        }

        if self.prefix_stats.is_empty() {
            bail!("prefix_stats must not be empty");
        }

        let percent = self.key_flush.percent;
        if !(percent > 0.0 && percent <= 100.0) {
            bail!("key_flush.percent must be within (0, 100], got {percent}");
        }

        for pct in self.percent_threshold.to_vec() {
            if !pct.is_finite() || pct == 0.0 || pct.abs() > 100.0 {
                bail!("percent_threshold values must be non-zero and within [-100, 100], got {pct}");
            }
        }

        for name in &self.backends {
            if !KNOWN_BACKENDS.contains(&name.as_str()) {
                bail!("unknown backend: {name}");
            }
        }

        if self.backends.iter().any(|b| b == "graphite") && self.graphite.port == 0 {
            bail!("graphite.port must be positive");
        }

        Ok(())
    }

    /// Percentile thresholds as a list.
    pub fn percent_thresholds(&self) -> Vec<f64> {
        self.percent_threshold.to_vec()
    }

    /// Whether the key activity sampler runs.
    pub fn key_flush_enabled(&self) -> bool {
        !self.key_flush.interval.is_zero()
    }
}
