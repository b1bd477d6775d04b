//! Core types for captured log records.
//!
//! This module provides:
//! - [`Message`] - One decoded log line with its metadata
//! - [`Source`] - The output stream a line came from
//! - [`PartialLogMeta`] - Continuation data for lines split across records
//! - [`ReadConfig`] - Parameters of one historical/live read session

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoggerError;

/// Output stream of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl Source {
    /// Returns the wire name of this stream.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(LoggerError::Decode(format!("unknown stream type {other:?}"))),
        }
    }
}

/// Marks a record as one fragment of a longer line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialLogMeta {
    /// Identifier shared by all fragments of one line.
    pub id: String,
    /// Position of this fragment, starting at 1.
    pub ordinal: u32,
    /// Whether this is the final fragment.
    pub last: bool,
}

/// One decoded log record.
///
/// Ownership moves to whichever consumer receives it; records are not
/// mutated after they have been handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stream the line was written to.
    pub source: Source,
    /// When the line was captured.
    pub timestamp: DateTime<Utc>,
    /// Raw line bytes, without the trailing newline.
    pub line: Vec<u8>,
    /// Extra key/value metadata.
    pub attrs: BTreeMap<String, String>,
    /// Set when the line continues in a following record.
    pub partial: Option<PartialLogMeta>,
}

impl Message {
    /// Creates a complete record stamped with `timestamp`.
    #[must_use]
    pub fn new(source: Source, timestamp: DateTime<Utc>, line: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            timestamp,
            line: line.into(),
            attrs: BTreeMap::new(),
            partial: None,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Marks this record as a fragment.
    #[must_use]
    pub fn with_partial(mut self, partial: PartialLogMeta) -> Self {
        self.partial = Some(partial);
        self
    }

    /// Returns true if the line continues in a later record.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.partial.as_ref().is_some_and(|p| !p.last)
    }

    /// Returns the line as text, replacing invalid UTF-8.
    #[must_use]
    pub fn line_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }

    /// Clears the record so it can be reused for parsing.
    pub fn reset(&mut self) {
        self.line.clear();
        self.attrs.clear();
        self.partial = None;
        self.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        self.source = Source::Stdout;
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(Source::Stdout, DateTime::<Utc>::UNIX_EPOCH, Vec::new())
    }
}

/// Request parameters for one read session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    /// Drop records older than this.
    pub since: Option<DateTime<Utc>>,
    /// Stop at the first record newer than this.
    pub until: Option<DateTime<Utc>>,
    /// Number of trailing records to return; negative means all.
    pub tail: i64,
    /// Keep the session open for newly written records.
    pub follow: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            tail: -1,
            follow: false,
        }
    }
}

impl ReadConfig {
    /// Reads every retained record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Reads the last `n` records.
    #[must_use]
    pub fn tail(n: i64) -> Self {
        Self {
            tail: n,
            ..Self::default()
        }
    }

    /// Sets the follow flag.
    #[must_use]
    pub const fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    /// Sets the lower time bound.
    #[must_use]
    pub const fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the upper time bound.
    #[must_use]
    pub const fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Returns true if a record with this timestamp is older than `since`.
    #[must_use]
    pub fn is_before_since(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.is_some_and(|since| timestamp < since)
    }

    /// Returns true if a record with this timestamp is newer than `until`.
    #[must_use]
    pub fn is_after_until(&self, timestamp: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| timestamp > until)
    }
}
