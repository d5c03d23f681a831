pub mod policy;

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::protocol::{parse_packet, MetricKind, MetricLine, MetricSample};

pub use self::policy::ResetPolicy;

/// Errors raised when applying a sample to the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("key {key:?} is a {existing}, cannot apply a {incoming} sample")]
    KindConflict {
        key: String,
        existing: MetricKind,
        incoming: MetricKind,
    },

    #[error("{kind} sample for key {key:?} scales to a non-finite value")]
    NonFinite { key: String, kind: MetricKind },
}

/// Borrowed, read-only view of every bucket map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot<'a> {
    pub counters: &'a HashMap<String, f64>,
    pub timers: &'a HashMap<String, Vec<f64>>,
    pub gauges: &'a HashMap<String, f64>,
    pub sets: &'a HashMap<String, HashSet<String>>,
}

/// Message statistics reported by the console `stats` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStats {
    /// Unix seconds of the last received datagram.
    pub last_msg_seen: u64,
    /// Malformed field groups since startup. Never reset.
    pub bad_lines_seen: u64,
}

impl MessageStats {
    /// Stat names and values in display order.
    pub fn entries(&self) -> [(&'static str, u64); 2] {
        [
            ("last_msg_seen", self.last_msg_seen),
            ("bad_lines_seen", self.bad_lines_seen),
        ]
    }
}

/// Outcome of ingesting one datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: usize,
    pub samples: usize,
    pub bad_lines: usize,
}

/// In-memory aggregation buckets.
///
/// Owned by a single worker; nothing here is synchronized.
#[derive(Debug)]
pub struct Store {
    counters: HashMap<String, f64>,
    timers: HashMap<String, Vec<f64>>,
    gauges: HashMap<String, f64>,
    sets: HashMap<String, HashSet<String>>,
    bad_lines_key: String,
    packets_received_key: String,
    messages: MessageStats,
}

impl Store {
    /// Creates a store with the daemon's own counters under `prefix_stats`.
    pub fn new(prefix_stats: &str, startup_time: u64) -> Self {
        let bad_lines_key = format!("{prefix_stats}.bad_lines_seen");
        let packets_received_key = format!("{prefix_stats}.packets_received");

        let mut counters = HashMap::new();
        counters.insert(bad_lines_key.clone(), 0.0);
        counters.insert(packets_received_key.clone(), 0.0);

        Self {
            counters,
            timers: HashMap::new(),
            gauges: HashMap::new(),
            sets: HashMap::new(),
            bad_lines_key,
            packets_received_key,
            messages: MessageStats {
                last_msg_seen: startup_time,
                bad_lines_seen: 0,
            },
        }
    }

    /// Parses a datagram and applies every valid sample in arrival order.
    ///
    /// `on_line` sees each non-empty line before its samples are applied.
    pub fn ingest<F>(&mut self, payload: &str, now: u64, mut on_line: F) -> IngestSummary
    where
        F: FnMut(&MetricLine<'_>),
    {
        let mut summary = IngestSummary::default();
        self.bump_internal(InternalCounter::PacketsReceived);

        for line in parse_packet(payload) {
            summary.lines += 1;
            on_line(&line);

            for sample in line.samples() {
                let applied = match sample {
                    Ok(sample) => self.apply(line.key(), sample).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };

                match applied {
                    Ok(()) => summary.samples += 1,
                    Err(error) => {
                        debug!(line = line.raw(), %error, "bad line");
                        summary.bad_lines += 1;
                        self.record_bad_line();
                    }
                }
            }
        }

        self.messages.last_msg_seen = now;
        summary
    }

    /// Applies one decoded sample to the bucket of its type.
    pub fn apply(&mut self, key: &str, sample: MetricSample<'_>) -> Result<(), StoreError> {
        match sample {
            MetricSample::Counter { value, sample_rate } => {
                self.apply_counter(key, value * (1.0 / sample_rate))
            }
            MetricSample::Timer(value) => self.apply_timer(key, value),
            MetricSample::Gauge(value) => self.set_gauge(key, value),
            MetricSample::Set(member) => self.add_to_set(key, member),
        }
    }

    /// Adds `delta` to a counter. The counter is left unchanged if the
    /// result would not be finite.
    pub fn apply_counter(&mut self, key: &str, delta: f64) -> Result<(), StoreError> {
        let non_finite = || StoreError::NonFinite {
            key: key.to_string(),
            kind: MetricKind::Counter,
        };
        if !delta.is_finite() {
            return Err(non_finite());
        }
        if let Some(value) = self.counters.get_mut(key) {
            let sum = *value + delta;
            if !sum.is_finite() {
                return Err(non_finite());
            }
            *value = sum;
            return Ok(());
        }
        self.check_kind(key, MetricKind::Counter)?;
        self.counters.insert(key.to_string(), delta);
        Ok(())
    }

    /// Appends a timer observation.
    pub fn apply_timer(&mut self, key: &str, value: f64) -> Result<(), StoreError> {
        if let Some(values) = self.timers.get_mut(key) {
            values.push(value);
            return Ok(());
        }
        self.check_kind(key, MetricKind::Timer)?;
        self.timers.insert(key.to_string(), vec![value]);
        Ok(())
    }

    /// Overwrites a gauge.
    pub fn set_gauge(&mut self, key: &str, value: f64) -> Result<(), StoreError> {
        if let Some(current) = self.gauges.get_mut(key) {
            *current = value;
            return Ok(());
        }
        self.check_kind(key, MetricKind::Gauge)?;
        self.gauges.insert(key.to_string(), value);
        Ok(())
    }

    /// Inserts a set member.
    pub fn add_to_set(&mut self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(members) = self.sets.get_mut(key) {
            if !members.contains(member) {
                members.insert(member.to_string());
            }
            return Ok(());
        }
        self.check_kind(key, MetricKind::Set)?;
        self.sets
            .insert(key.to_string(), HashSet::from([member.to_string()]));
        Ok(())
    }

    /// Returns the bucket type currently held by `key`, if any.
    pub fn kind_of(&self, key: &str) -> Option<MetricKind> {
        if self.counters.contains_key(key) {
            Some(MetricKind::Counter)
        } else if self.timers.contains_key(key) {
            Some(MetricKind::Timer)
        } else if self.gauges.contains_key(key) {
            Some(MetricKind::Gauge)
        } else if self.sets.contains_key(key) {
            Some(MetricKind::Set)
        } else {
            None
        }
    }

    fn check_kind(&self, key: &str, incoming: MetricKind) -> Result<(), StoreError> {
        match self.kind_of(key) {
            Some(existing) if existing != incoming => Err(StoreError::KindConflict {
                key: key.to_string(),
                existing,
                incoming,
            }),
            _ => Ok(()),
        }
    }

    /// Removes `key` from the bucket map of `kind`. Returns whether it existed.
    pub fn delete(&mut self, kind: MetricKind, key: &str) -> bool {
        match kind {
            MetricKind::Counter => self.counters.remove(key).is_some(),
            MetricKind::Timer => self.timers.remove(key).is_some(),
            MetricKind::Gauge => self.gauges.remove(key).is_some(),
            MetricKind::Set => self.sets.remove(key).is_some(),
        }
    }

    /// Read-only view of all buckets.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            counters: &self.counters,
            timers: &self.timers,
            gauges: &self.gauges,
            sets: &self.sets,
        }
    }

    /// Applies the flush-time delete or reset action to every bucket.
    pub fn reset(&mut self, policy: &ResetPolicy) {
        if policy.delete_counters {
            self.counters.clear();
        } else {
            self.counters.values_mut().for_each(|v| *v = 0.0);
        }

        if policy.delete_timers {
            self.timers.clear();
        } else {
            self.timers.values_mut().for_each(Vec::clear);
        }

        if policy.delete_sets {
            self.sets.clear();
        } else {
            self.sets.values_mut().for_each(HashSet::clear);
        }

        // Gauges keep their last value unless deletion is requested.
        if policy.delete_gauges {
            self.gauges.clear();
        }
    }

    /// Number of keys per bucket type.
    pub fn bucket_counts(&self) -> [(MetricKind, usize); 4] {
        [
            (MetricKind::Counter, self.counters.len()),
            (MetricKind::Timer, self.timers.len()),
            (MetricKind::Gauge, self.gauges.len()),
            (MetricKind::Set, self.sets.len()),
        ]
    }

    pub fn counters(&self) -> &HashMap<String, f64> {
        &self.counters
    }

    pub fn timers(&self) -> &HashMap<String, Vec<f64>> {
        &self.timers
    }

    pub fn gauges(&self) -> &HashMap<String, f64> {
        &self.gauges
    }

    pub fn sets(&self) -> &HashMap<String, HashSet<String>> {
        &self.sets
    }

    pub fn messages(&self) -> MessageStats {
        self.messages
    }

    /// Key of the daemon's bad line counter.
    pub fn bad_lines_key(&self) -> &str {
        &self.bad_lines_key
    }

    /// Key of the daemon's packet counter.
    pub fn packets_received_key(&self) -> &str {
        &self.packets_received_key
    }

    fn record_bad_line(&mut self) {
        self.messages.bad_lines_seen += 1;
        self.bump_internal(InternalCounter::BadLinesSeen);
    }

    fn bump_internal(&mut self, which: InternalCounter) {
        let key = match which {
            InternalCounter::BadLinesSeen => &self.bad_lines_key,
            InternalCounter::PacketsReceived => &self.packets_received_key,
        };
        if let Some(value) = self.counters.get_mut(key) {
            *value += 1.0;
            return;
        }

        let key = key.clone();
        if let Err(e) = self.apply_counter(&key, 1.0) {
            debug!(error = %e, "internal counter shadowed by another bucket type");
        }
    }
}

#[derive(Clone, Copy)]
enum InternalCounter {
    BadLinesSeen,
    PacketsReceived,
}
