use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::config::KeyFlushConfig;

/// Destination of key activity reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutput {
    Stdout,
    /// Appended to, created if missing.
    File(PathBuf),
}

/// Counts arrivals per key between report cycles.
#[derive(Debug)]
pub struct KeySampler {
    counts: HashMap<String, u64>,
    percent: f64,
    output: ReportOutput,
}

impl KeySampler {
    pub fn new(percent: f64, output: ReportOutput) -> Self {
        Self {
            counts: HashMap::new(),
            percent,
            output,
        }
    }

    pub fn from_config(cfg: &KeyFlushConfig) -> Self {
        let output = match &cfg.log {
            Some(path) => ReportOutput::File(path.clone()),
            None => ReportOutput::Stdout,
        };
        Self::new(cfg.percent, output)
    }

    /// Records one arrival for `key`.
    pub fn record(&mut self, key: &str) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += 1;
        } else {
            self.counts.insert(key.to_string(), 1);
        }
    }

    /// Number of distinct keys seen this cycle.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn output(&self) -> &ReportOutput {
        &self.output
    }

    /// Returns the busiest keys and clears every count.
    ///
    /// Keys are ordered by count descending, then by key. The first
    /// `ceil(n * percent / 100)` are kept.
    pub fn drain_top(&mut self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self.counts.drain().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let keep = (entries.len() as f64 * self.percent / 100.0).ceil() as usize;
        entries.truncate(keep);
        entries
    }

    /// Drains the counts into a formatted report.
    pub fn take_report(&mut self, now: DateTime<Utc>) -> String {
        format_report(&self.drain_top(), now)
    }
}

/// Formats `<time> count=<n> key=<key>` lines.
pub fn format_report(entries: &[(String, u64)], now: DateTime<Utc>) -> String {
    let time = now.format("%a %b %d %Y %H:%M:%S %z");
    entries
        .iter()
        .map(|(key, count)| format!("{time} count={count} key={key}\n"))
        .collect()
}

/// Writes a report to its destination.
pub async fn write_report(output: &ReportOutput, report: &str) -> Result<()> {
    match output {
        ReportOutput::Stdout => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(report.as_bytes())
                .await
                .context("writing key report to stdout")?;
            stdout.flush().await.context("flushing stdout")?;
        }
        ReportOutput::File(path) => {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("opening key log {}", path.display()))?;
            file.write_all(report.as_bytes())
                .await
                .with_context(|| format!("writing key log {}", path.display()))?;
            file.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sampler(percent: f64) -> KeySampler {
        KeySampler::new(percent, ReportOutput::Stdout)
    }

    fn record_many(s: &mut KeySampler, key: &str, n: usize) {
        for _ in 0..n {
            s.record(key);
        }
    }

    #[test]
    fn test_drain_sorts_by_count_then_key() {
        let mut s = sampler(100.0);
        record_many(&mut s, "b", 2);
        record_many(&mut s, "a", 2);
        record_many(&mut s, "c", 5);
        record_many(&mut s, "d", 1);

        let top = s.drain_top();
        let keys: Vec<&str> = top.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b", "d"]);
        assert_eq!(top[0].1, 5);
        assert!(s.is_empty());
    }

    #[test]
    fn test_percent_rounds_up() {
        let mut s = sampler(10.0);
        for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
            record_many(&mut s, key, i + 1);
        }
        let top = s.drain_top();
        assert_eq!(top, vec![("k3".to_string(), 3)]);
    }

    #[test]
    fn test_empty_cycle() {
        let mut s = sampler(50.0);
        assert!(s.drain_top().is_empty());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(s.take_report(now), "");
    }

    #[test]
    fn test_report_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap();
        let report = format_report(&[("api.hits".to_string(), 7)], now);
        assert_eq!(
            report,
            "Tue Mar 05 2024 12:30:00 +0000 count=7 key=api.hits\n"
        );
    }

    #[test]
    fn test_from_config_output() {
        let cfg = KeyFlushConfig {
            log: Some(PathBuf::from("/tmp/keys.log")),
            ..Default::default()
        };
        let s = KeySampler::from_config(&cfg);
        assert_eq!(s.output(), &ReportOutput::File(PathBuf::from("/tmp/keys.log")));
        assert_eq!(
            KeySampler::from_config(&KeyFlushConfig::default()).output(),
            &ReportOutput::Stdout
        );
    }

    #[tokio::test]
    async fn test_write_report_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.log");
        let output = ReportOutput::File(path.clone());

        write_report(&output, "first\n").await.expect("write");
        write_report(&output, "second\n").await.expect("write");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }
}
