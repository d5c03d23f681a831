use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use tracing::warn;

use crate::bus::Bus;
use crate::protocol::MetricKind;
use crate::store::Store;

const HELP: &str =
    "Commands: stats, counters, timers, gauges, delcounters, deltimers, delgauges, quit\n\n";
const END: &str = "END\n\n";
const ERROR: &str = "ERROR\n";

/// One parsed console command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Stats,
    Counters,
    Timers,
    Gauges,
    Delete { kind: MetricKind, keys: Vec<String> },
    Quit,
    Unknown(String),
}

impl Command {
    /// Parses a line: the first whitespace-separated token is the command,
    /// the rest are its arguments.
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return Self::Unknown(String::new());
        };

        let delete = |kind| Self::Delete {
            kind,
            keys: line
                .split_whitespace()
                .skip(1)
                .map(str::to_string)
                .collect(),
        };

        match name {
            "help" => Self::Help,
            "stats" => Self::Stats,
            "counters" => Self::Counters,
            "timers" => Self::Timers,
            "gauges" => Self::Gauges,
            "delcounters" => delete(MetricKind::Counter),
            "deltimers" => delete(MetricKind::Timer),
            "delgauges" => delete(MetricKind::Gauge),
            "quit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Label used for the command in metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Stats => "stats",
            Self::Counters => "counters",
            Self::Timers => "timers",
            Self::Gauges => "gauges",
            Self::Delete {
                kind: MetricKind::Counter,
                ..
            } => "delcounters",
            Self::Delete {
                kind: MetricKind::Timer,
                ..
            } => "deltimers",
            Self::Delete {
                kind: MetricKind::Gauge,
                ..
            } => "delgauges",
            Self::Delete {
                kind: MetricKind::Set,
                ..
            } => "delsets",
            Self::Quit => "quit",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Daemon state a command runs against.
pub struct ConsoleState<'a> {
    pub store: &'a mut Store,
    pub bus: &'a Bus,
    pub startup_time: u64,
    pub now: u64,
}

/// Runs a command and returns the full response text.
///
/// `Quit` yields an empty response; closing the connection is up to the
/// caller.
pub fn execute(command: &Command, ctx: ConsoleState<'_>) -> String {
    match command {
        Command::Help => HELP.to_string(),
        Command::Stats => stats(&ctx),
        Command::Counters => dump(ctx.store.counters()),
        Command::Timers => dump(ctx.store.timers()),
        Command::Gauges => dump(ctx.store.gauges()),
        Command::Delete { kind, keys } => {
            let mut out = String::new();
            for key in keys {
                ctx.store.delete(*kind, key);
                let _ = writeln!(out, "deleted: {key}");
            }
            out.push_str(END);
            out
        }
        Command::Quit => String::new(),
        Command::Unknown(_) => ERROR.to_string(),
    }
}

fn stats(ctx: &ConsoleState<'_>) -> String {
    let now = ctx.now;
    let mut out = String::new();
    let _ = writeln!(out, "uptime: {}", now.saturating_sub(ctx.startup_time));

    let mut write_stat = |group: &str, metric: &str, value: i64| {
        // Timestamps are shown as seconds elapsed.
        let shown = if metric.starts_with("last_") {
            i64::try_from(now).unwrap_or(i64::MAX) - value
        } else {
            value
        };
        let _ = writeln!(out, "{group}.{metric}: {shown}");
    };

    for (metric, value) in ctx.store.messages().entries() {
        write_stat(
            "messages",
            metric,
            i64::try_from(value).unwrap_or(i64::MAX),
        );
    }

    ctx.bus.publish_status(&mut |backend, stat| match stat {
        Ok((metric, value)) => write_stat(backend, metric, value),
        Err(e) => warn!(backend, error = %e, "failed to read backend stats"),
    });

    out.push_str(END);
    out
}

/// Pretty JSON object with sorted keys, followed by the END marker.
fn dump<V: Serialize>(map: &std::collections::HashMap<String, V>) -> String {
    let sorted: BTreeMap<&String, &V> = map.iter().collect();
    match serde_json::to_string_pretty(&sorted) {
        Ok(json) => format!("{json}\n{END}"),
        Err(e) => {
            warn!(error = %e, "serializing console dump");
            ERROR.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::console::ConsoleBackend;

    fn run(command: &str, store: &mut Store, bus: &Bus) -> String {
        execute(
            &Command::parse(command),
            ConsoleState {
                store,
                bus,
                startup_time: 100,
                now: 160,
            },
        )
    }

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse("help"), Command::Help);
        assert_eq!(Command::parse("  stats \r"), Command::Stats);
        assert_eq!(
            Command::parse("delcounters a  b"),
            Command::Delete {
                kind: MetricKind::Counter,
                keys: vec!["a".to_string(), "b".to_string()],
            }
        );
        assert_eq!(Command::parse("bogus x"), Command::Unknown("bogus".to_string()));
        assert_eq!(Command::parse(""), Command::Unknown(String::new()));
        assert_eq!(Command::parse("deltimers").name(), "deltimers");
    }

    #[test]
    fn test_help() {
        let mut store = Store::new("statsd", 100);
        assert_eq!(
            run("help", &mut store, &Bus::new()),
            "Commands: stats, counters, timers, gauges, delcounters, deltimers, delgauges, quit\n\n"
        );
    }

    #[test]
    fn test_unknown_command() {
        let mut store = Store::new("statsd", 100);
        assert_eq!(run("frobnicate", &mut store, &Bus::new()), "ERROR\n");
    }

    #[test]
    fn test_counters_dump_is_sorted_json() {
        let mut store = Store::new("statsd", 100);
        store.ingest("foo:5|c", 150, |_| {});

        let out = run("counters", &mut store, &Bus::new());
        assert!(out.ends_with("\nEND\n\n"));

        let json = out.trim_end_matches("\nEND\n\n");
        let parsed: BTreeMap<String, f64> = serde_json::from_str(json).expect("json");
        assert_eq!(parsed.get("foo"), Some(&5.0));
        assert_eq!(parsed.get("statsd.packets_received"), Some(&1.0));

        let foo = json.find("\"foo\"").expect("foo");
        let internal = json.find("\"statsd.bad_lines_seen\"").expect("internal");
        assert!(foo < internal);
    }

    #[test]
    fn test_timers_and_gauges_dump() {
        let mut store = Store::new("statsd", 100);
        store.ingest("lat:1|ms:2|ms\ntemp:7|g", 150, |_| {});

        let timers = run("timers", &mut store, &Bus::new());
        let json = timers.trim_end_matches("\nEND\n\n");
        let parsed: BTreeMap<String, Vec<f64>> = serde_json::from_str(json).expect("json");
        assert_eq!(parsed["lat"], vec![1.0, 2.0]);

        let gauges = run("gauges", &mut store, &Bus::new());
        assert!(gauges.contains("\"temp\": 7.0"));
    }

    #[test]
    fn test_delcounters() {
        let mut store = Store::new("statsd", 100);
        store.ingest("foo:5|c", 150, |_| {});

        let out = run("delcounters foo missing", &mut store, &Bus::new());
        assert_eq!(out, "deleted: foo\ndeleted: missing\nEND\n\n");
        assert!(store.counters().get("foo").is_none());

        let dump = run("counters", &mut store, &Bus::new());
        assert!(!dump.contains("\"foo\""));
    }

    #[test]
    fn test_delgauges_only_touches_gauges() {
        let mut store = Store::new("statsd", 100);
        store.ingest("g1:5|g\nc1:1|c", 150, |_| {});

        run("delgauges g1 c1", &mut store, &Bus::new());
        assert!(store.gauges().is_empty());
        assert_eq!(store.counters().get("c1"), Some(&1.0));
    }

    #[test]
    fn test_stats_output() {
        let mut store = Store::new("statsd", 100);
        store.ingest("foo:1|c\nbad", 150, |_| {});
        store.ingest("foo", 155, |_| {});
        store.ingest("x:1", 155, |_| {});

        let mut bus = Bus::new();
        bus.subscribe(Box::new(ConsoleBackend::new(100)));

        let out = run("stats", &mut store, &bus);
        assert_eq!(
            out,
            "uptime: 60\n\
             messages.last_msg_seen: 5\n\
             messages.bad_lines_seen: 1\n\
             console.last_flush: 60\n\
             console.flushes: 0\n\
             END\n\n"
        );
    }
}
