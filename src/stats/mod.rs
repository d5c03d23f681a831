//! Statistics derived from a bucket snapshot at flush time.
//!
//! The flush scheduler hands a [`Snapshot`] to a [`MetricsProcessor`],
//! which returns the [`Metrics`] that backends receive: the raw buckets
//! plus per-second counter rates and timer summaries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::store::Snapshot;

/// Flush payload published to every backend.
#[derive(Debug, Clone)]
pub struct Metrics<'a> {
    pub counters: &'a HashMap<String, f64>,
    pub timers: &'a HashMap<String, Vec<f64>>,
    pub gauges: &'a HashMap<String, f64>,
    pub sets: &'a HashMap<String, HashSet<String>>,
    /// Counter value divided by the flush interval in seconds.
    pub counter_rates: HashMap<String, f64>,
    /// Summary statistics per timer, keyed by stat name (`mean`, `upper_90`, ...).
    pub timer_data: HashMap<String, BTreeMap<String, f64>>,
    /// Statistics about the derivation itself (`processing_time` in ms).
    pub statsd_metrics: BTreeMap<String, f64>,
    pub pct_threshold: Vec<f64>,
}

/// Turns a snapshot into the enriched flush payload.
pub trait MetricsProcessor: Send {
    fn process<'a>(
        &self,
        snapshot: Snapshot<'a>,
        flush_interval: Duration,
        timestamp: u64,
    ) -> Metrics<'a>;
}

/// Rates, percentiles, mean, median and standard deviation.
#[derive(Debug, Clone)]
pub struct StandardProcessor {
    pct_thresholds: Vec<f64>,
}

impl StandardProcessor {
    pub fn new(pct_thresholds: Vec<f64>) -> Self {
        Self { pct_thresholds }
    }
}

impl MetricsProcessor for StandardProcessor {
    fn process<'a>(
        &self,
        snapshot: Snapshot<'a>,
        flush_interval: Duration,
        _timestamp: u64,
    ) -> Metrics<'a> {
        let started = Instant::now();
        let interval_secs = flush_interval.as_secs_f64();

        let counter_rates = snapshot
            .counters
            .iter()
            .map(|(key, value)| (key.clone(), value / interval_secs))
            .collect();

        let timer_data = snapshot
            .timers
            .iter()
            .map(|(key, values)| {
                (
                    key.clone(),
                    timer_stats(values, &self.pct_thresholds, interval_secs),
                )
            })
            .collect();

        let mut statsd_metrics = BTreeMap::new();
        statsd_metrics.insert(
            "processing_time".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        Metrics {
            counters: snapshot.counters,
            timers: snapshot.timers,
            gauges: snapshot.gauges,
            sets: snapshot.sets,
            counter_rates,
            timer_data,
            statsd_metrics,
            pct_threshold: self.pct_thresholds.clone(),
        }
    }
}

/// Computes the summary statistics of one timer.
pub fn timer_stats(values: &[f64], pct_thresholds: &[f64], interval_secs: f64) -> BTreeMap<String, f64> {
    let mut data = BTreeMap::new();
    if values.is_empty() {
        data.insert("count".to_string(), 0.0);
        data.insert("count_ps".to_string(), 0.0);
        return data;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len();
    let min = sorted[0];
    let max = sorted[count - 1];

    let mut cumulative = Vec::with_capacity(count);
    let mut running = 0.0;
    for v in &sorted {
        running += v;
        cumulative.push(running);
    }
    let sum = running;
    let mean = sum / count as f64;

    for &pct in pct_thresholds {
        let (boundary, pct_sum, pct_mean) = if count == 1 {
            (max, min, min)
        } else {
            let in_threshold = ((pct.abs() / 100.0) * count as f64).round() as usize;
            if in_threshold == 0 {
                continue;
            }
            let in_threshold = in_threshold.min(count);
            if pct > 0.0 {
                let s = cumulative[in_threshold - 1];
                (sorted[in_threshold - 1], s, s / in_threshold as f64)
            } else {
                let first = count - in_threshold;
                let before = if first == 0 { 0.0 } else { cumulative[first - 1] };
                let s = sum - before;
                (sorted[first], s, s / in_threshold as f64)
            }
        };

        let clean = clean_pct(pct);
        let bound_name = if pct > 0.0 { "upper" } else { "lower" };
        data.insert(format!("mean_{clean}"), pct_mean);
        data.insert(format!("{bound_name}_{clean}"), boundary);
        data.insert(format!("sum_{clean}"), pct_sum);
    }

    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let mid = count / 2;
    let median = if count % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    };

    data.insert("std".to_string(), variance.sqrt());
    data.insert("upper".to_string(), max);
    data.insert("lower".to_string(), min);
    data.insert("count".to_string(), count as f64);
    data.insert("count_ps".to_string(), count as f64 / interval_secs);
    data.insert("sum".to_string(), sum);
    data.insert("mean".to_string(), mean);
    data.insert("median".to_string(), median);
    data
}

/// Formats a percentile for use in a stat name: `99.5` -> `99_5`, `-10` -> `top10`.
fn clean_pct(pct: f64) -> String {
    pct.to_string().replace('.', "_").replace('-', "top")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn stat(data: &BTreeMap<String, f64>, name: &str) -> f64 {
        *data.get(name).unwrap_or_else(|| panic!("missing {name} in {data:?}"))
    }

    #[test]
    fn test_clean_pct() {
        assert_eq!(clean_pct(90.0), "90");
        assert_eq!(clean_pct(99.5), "99_5");
        assert_eq!(clean_pct(-10.0), "top10");
    }

    #[test]
    fn test_empty_timer() {
        let data = timer_stats(&[], &[90.0], 10.0);
        assert_eq!(stat(&data, "count"), 0.0);
        assert_eq!(stat(&data, "count_ps"), 0.0);
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_single_value_timer() {
        let data = timer_stats(&[320.0], &[90.0], 10.0);
        assert_eq!(stat(&data, "count"), 1.0);
        assert_eq!(stat(&data, "upper_90"), 320.0);
        assert_eq!(stat(&data, "mean_90"), 320.0);
        assert_eq!(stat(&data, "sum_90"), 320.0);
        assert_eq!(stat(&data, "median"), 320.0);
        assert_eq!(stat(&data, "std"), 0.0);
        assert_eq!(stat(&data, "count_ps"), 0.1);
    }

    #[test]
    fn test_ten_value_timer() {
        let values: Vec<f64> = (1..=10).rev().map(f64::from).collect();
        let data = timer_stats(&values, &[90.0, -20.0], 10.0);

        assert_eq!(stat(&data, "lower"), 1.0);
        assert_eq!(stat(&data, "upper"), 10.0);
        assert_eq!(stat(&data, "sum"), 55.0);
        assert_eq!(stat(&data, "mean"), 5.5);
        assert_eq!(stat(&data, "median"), 5.5);
        assert_eq!(stat(&data, "count_ps"), 1.0);

        assert_eq!(stat(&data, "upper_90"), 9.0);
        assert_eq!(stat(&data, "sum_90"), 45.0);
        assert_eq!(stat(&data, "mean_90"), 5.0);

        assert_eq!(stat(&data, "lower_top20"), 9.0);
        assert_eq!(stat(&data, "sum_top20"), 19.0);
        assert_eq!(stat(&data, "mean_top20"), 9.5);

        let expected_std = (82.5f64 / 10.0).sqrt();
        assert!((stat(&data, "std") - expected_std).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_percentile_is_skipped() {
        let data = timer_stats(&[1.0, 2.0, 3.0], &[10.0], 1.0);
        assert!(!data.contains_key("upper_10"));
        assert_eq!(stat(&data, "median"), 2.0);
    }

    #[test]
    fn test_processor_rates() {
        let mut store = Store::new("statsd", 0);
        store.apply_counter("hits", 50.0).expect("apply");
        store.apply_timer("lat", 4.0).expect("apply");

        let processor = StandardProcessor::new(vec![90.0]);
        let metrics = processor.process(store.snapshot(), Duration::from_secs(10), 0);

        assert_eq!(metrics.counter_rates.get("hits"), Some(&5.0));
        assert_eq!(metrics.counters.get("hits"), Some(&50.0));
        assert_eq!(metrics.timer_data["lat"]["count"], 1.0);
        assert!(metrics.statsd_metrics.contains_key("processing_time"));
        assert_eq!(metrics.pct_threshold, vec![90.0]);
    }
}
