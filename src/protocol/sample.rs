use std::fmt;

/// Bucket type of an aggregated metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Timer,
    Gauge,
    Set,
}

impl MetricKind {
    /// All kinds, in flush order.
    pub const ALL: [MetricKind; 4] = [Self::Counter, Self::Timer, Self::Gauge, Self::Set];

    /// Returns the lowercase name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Timer => "timer",
            Self::Gauge => "gauge",
            Self::Set => "set",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded field group of a metric line.
///
/// Set members borrow from the datagram; the store copies them on insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricSample<'a> {
    /// Counter increment, scaled by `1 / sample_rate` when applied.
    Counter { value: f64, sample_rate: f64 },
    /// Timer observation.
    Timer(f64),
    /// Absolute gauge value.
    Gauge(f64),
    /// Set member.
    Set(&'a str),
}

impl MetricSample<'_> {
    /// Returns the bucket type this sample applies to.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Timer(_) => MetricKind::Timer,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Set(_) => MetricKind::Set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_kind() {
        let counter = MetricSample::Counter {
            value: 1.0,
            sample_rate: 1.0,
        };
        assert_eq!(counter.kind(), MetricKind::Counter);
        assert_eq!(MetricSample::Timer(3.0).kind(), MetricKind::Timer);
        assert_eq!(MetricSample::Gauge(3.0).kind(), MetricKind::Gauge);
        assert_eq!(MetricSample::Set("u1").kind(), MetricKind::Set);
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<&str> = MetricKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["counter", "timer", "gauge", "set"]);
        assert_eq!(MetricKind::Timer.to_string(), "timer");
    }
}
