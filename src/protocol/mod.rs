pub mod parse;
pub mod sample;

pub use self::parse::{parse_packet, sanitize_key, MetricLine, ParseError};
pub use self::sample::{MetricKind, MetricSample};
