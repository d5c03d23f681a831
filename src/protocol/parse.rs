//! Parsing for the statsd line protocol.
//!
//! A datagram holds newline-separated lines of the form
//! `key:value|type[|@rate][:value|type...]`. Parsing is lazy: lines and
//! their field groups are decoded while the caller iterates, so a datagram
//! is applied to the store without an intermediate sample buffer.

use std::str::Split;

use thiserror::Error;

use super::sample::MetricSample;

/// Errors for a single malformed field group.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("missing metric type in field group {group:?}")]
    MissingType { group: String },

    #[error("invalid sample rate {raw:?}")]
    InvalidSampleRate { raw: String },

    #[error("invalid numeric value {raw:?}")]
    InvalidValue { raw: String },
}

/// Iterates over the non-empty lines of a datagram payload.
pub fn parse_packet(payload: &str) -> impl Iterator<Item = MetricLine<'_>> {
    payload
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(MetricLine::parse)
}

/// Sanitizes a raw key token.
///
/// Whitespace runs become `_`, `/` becomes `-`, and anything outside
/// `[A-Za-z0-9_.-]` is dropped.
pub fn sanitize_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut in_whitespace = false;

    for c in raw.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                key.push('_');
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;

        match c {
            '/' => key.push('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') => key.push(c),
            _ => {}
        }
    }

    key
}

/// One metric line: a sanitized key plus its undecoded field groups.
#[derive(Debug, Clone)]
pub struct MetricLine<'a> {
    raw: &'a str,
    key: String,
    fields: Option<&'a str>,
}

impl<'a> MetricLine<'a> {
    /// Splits a line into key and field groups.
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once(':') {
            Some((key, fields)) => Self {
                raw,
                key: sanitize_key(key),
                fields: Some(fields),
            },
            None => Self {
                raw,
                key: sanitize_key(raw),
                fields: None,
            },
        }
    }

    /// The line as received.
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    /// The sanitized key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decodes the field groups left to right.
    ///
    /// A bare key (no `:`) yields a single counter increment of 1.
    pub fn samples(&self) -> Samples<'a> {
        match self.fields {
            Some(fields) => Samples::Groups(fields.split(':')),
            None => Samples::Bare { pending: true },
        }
    }
}

/// Iterator over the decoded field groups of a [`MetricLine`].
#[derive(Debug)]
pub enum Samples<'a> {
    Bare { pending: bool },
    Groups(Split<'a, char>),
}

impl<'a> Iterator for Samples<'a> {
    type Item = Result<MetricSample<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Bare { pending } => {
                if !*pending {
                    return None;
                }
                *pending = false;
                Some(Ok(MetricSample::Counter {
                    value: 1.0,
                    sample_rate: 1.0,
                }))
            }
            Self::Groups(groups) => groups.next().map(parse_field_group),
        }
    }
}

/// Decodes one `value|type[|@rate]` group.
pub fn parse_field_group(group: &str) -> Result<MetricSample<'_>, ParseError> {
    let mut parts = group.split('|');
    let value = parts.next().unwrap_or_default();
    let Some(kind) = parts.next() else {
        return Err(ParseError::MissingType {
            group: group.to_string(),
        });
    };

    match kind.trim() {
        "ms" => Ok(MetricSample::Timer(parse_value(value, 0.0)?)),
        "g" => Ok(MetricSample::Gauge(parse_value(value, 0.0)?)),
        "s" => Ok(MetricSample::Set(if value.is_empty() { "0" } else { value })),
        _ => {
            let sample_rate = match parts.next() {
                Some(rate) if !rate.is_empty() => parse_sample_rate(rate)?,
                _ => 1.0,
            };
            Ok(MetricSample::Counter {
                value: parse_value(value, 1.0)?,
                sample_rate,
            })
        }
    }
}

fn parse_value(raw: &str, default: f64) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }

    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidValue {
            raw: raw.to_string(),
        }),
    }
}

/// Accepts `@<digits and dots>`, ignoring anything after the number.
fn parse_sample_rate(raw: &str) -> Result<f64, ParseError> {
    let invalid = || ParseError::InvalidSampleRate {
        raw: raw.to_string(),
    };

    let digits = raw.strip_prefix('@').ok_or_else(invalid)?;
    let end = digits
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(digits.len());

    match digits[..end].parse::<f64>() {
        Ok(rate) if rate > 0.0 && rate.is_finite() => Ok(rate),
        _ => Err(invalid()),
    }
}
