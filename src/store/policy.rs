use crate::config::Config;

/// Flush-time terminal action per bucket type.
///
/// `true` removes the key entirely. `false` resets counters, timers and
/// sets to their identity value and leaves gauges untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetPolicy {
    pub delete_counters: bool,
    pub delete_timers: bool,
    pub delete_sets: bool,
    pub delete_gauges: bool,
}

impl ResetPolicy {
    /// Resolves the policy from configuration.
    ///
    /// `delete_idle_stats` flips the default of every flag that is not set
    /// explicitly.
    pub fn from_config(cfg: &Config) -> Self {
        let fallback = cfg.delete_idle_stats;
        Self {
            delete_counters: cfg.delete_counters.unwrap_or(fallback),
            delete_timers: cfg.delete_timers.unwrap_or(fallback),
            delete_sets: cfg.delete_sets.unwrap_or(fallback),
            delete_gauges: cfg.delete_gauges.unwrap_or(fallback),
        }
    }

    /// Policy that deletes every bucket type.
    pub const fn delete_all() -> Self {
        Self {
            delete_counters: true,
            delete_timers: true,
            delete_sets: true,
            delete_gauges: true,
        }
    }
}
