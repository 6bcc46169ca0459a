//! Normalized event schema, as produced by the parsing pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The raw log line an event was parsed from, with its labels and source.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Line {
    /// The log line as it was read.
    #[serde(default, alias = "Raw")]
    pub raw: Box<str>,
    /// Labels assigned by the acquisition / parsing stage (e.g. `type`).
    #[serde(default, alias = "Labels")]
    pub labels: BTreeMap<String, String>,
    /// Where the line came from (file path, journald unit, ...).
    #[serde(default, alias = "Src")]
    pub src: Box<str>,
}

/// An immutable normalized log record.
#[non_exhaustive]
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Event {
    /// The originating line.
    #[serde(default, alias = "Line")]
    pub line: Line,
    /// When the line was originally observed, serialized in RFC 3339.
    #[serde(
        default,
        alias = "time",
        alias = "StrTime",
        alias = "MarshaledTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub marshaled_time: Option<String>,
}

impl Event {
    /// Create a builder for an event from its raw line.
    pub fn builder(raw: impl Into<Box<str>>) -> EventBuilder {
        EventBuilder {
            raw: raw.into(),
            labels: BTreeMap::new(),
            src: "".into(),
            marshaled_time: None,
        }
    }

    /// The serialized timestamp, treating an empty string as absent.
    pub fn serialized_time(&self) -> Option<&str> {
        self.marshaled_time.as_deref().filter(|s| !s.is_empty())
    }

    /// Parse the serialized timestamp into UTC.
    ///
    /// Returns `None` if the event has no serialized timestamp.
    pub fn parse_time(&self) -> Option<Result<DateTime<Utc>, WireTimeError>> {
        self.serialized_time().map(parse_wire_time)
    }

    /// The `type` label, if the parser set one.
    pub fn evt_type(&self) -> &str {
        self.line.labels.get("type").map(String::as_str).unwrap_or("")
    }

    /// The source descriptor of the line.
    pub fn evt_src(&self) -> &str {
        &self.line.src
    }
}

/// A serialized timestamp that is not in the wire format.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum WireTimeError {
    /// Not RFC 3339 at all.
    #[error(transparent)]
    Parse(#[from] chrono::ParseError),
    /// Parseable, but looser than the wire format allows.
    #[error("{0}")]
    NotStrict(&'static str),
}

/// Parse a timestamp in the event wire format (RFC 3339, any offset, optional fractional seconds).
///
/// The format is strict: an uppercase `T` between date and time, `Z` or a numeric offset,
/// and no surrounding whitespace.
pub fn parse_wire_time(s: &str) -> Result<DateTime<Utc>, WireTimeError> {
    if s.trim() != s {
        return Err(WireTimeError::NotStrict("surrounding whitespace"));
    }
    if s.len() > 10 && s.as_bytes()[10] != b'T' {
        return Err(WireTimeError::NotStrict("date and time must be separated by 'T'"));
    }
    if s.ends_with('z') {
        return Err(WireTimeError::NotStrict("UTC designator must be 'Z'"));
    }
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Format a timestamp in the event wire format.
pub fn format_wire_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Builder for [`Event`] instances.
#[derive(Clone, Debug)]
pub struct EventBuilder {
    raw: Box<str>,
    labels: BTreeMap<String, String>,
    src: Box<str>,
    marshaled_time: Option<String>,
}

impl EventBuilder {
    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the source descriptor.
    pub fn src(mut self, src: impl Into<Box<str>>) -> Self {
        self.src = src.into();
        self
    }

    /// Set the serialized timestamp verbatim. It is not validated here.
    pub fn marshaled_time(mut self, time: impl Into<String>) -> Self {
        self.marshaled_time = Some(time.into());
        self
    }

    /// Set the serialized timestamp from a UTC time.
    pub fn timestamp(self, ts: DateTime<Utc>) -> Self {
        self.marshaled_time(format_wire_time(ts))
    }

    /// Build the event.
    pub fn build(self) -> Event {
        Event {
            line: Line {
                raw: self.raw,
                labels: self.labels,
                src: self.src,
            },
            marshaled_time: self.marshaled_time,
        }
    }
}

impl From<EventBuilder> for Event {
    fn from(builder: EventBuilder) -> Self {
        builder.build()
    }
}
