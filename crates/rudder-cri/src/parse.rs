//! Line formats understood by the CRI reader.
//!
//! A CRI line looks like
//!
//! ```text
//! 2016-10-06T00:17:09.669794202Z stdout F log content
//! ```
//!
//! where the third field is a tag list separated by `:` whose first entry
//! is `P` for a fragment of a longer line and `F` for a full line. Some
//! runtimes still write the docker JSON-lines format, which is detected from
//! the first line of the file.

use chrono::{DateTime, Utc};
use rudder_jsonfile::jsonlog::JsonLogRecord;
use rudder_logger::Source;

use crate::error::{CriError, Result};

const DELIMITER: u8 = b' ';
const TAG_DELIMITER: u8 = b':';
const EOL: u8 = b'\n';

/// First tag of a CRI line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// A fragment; the line continues in the next record.
    Partial,
    /// The final (or only) piece of a line.
    Full,
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriLogLine {
    /// Time the runtime captured the line.
    pub timestamp: DateTime<Utc>,
    /// Stream the line was written to.
    pub stream: Source,
    /// Whether more of this line follows.
    pub tag: LogTag,
    /// Content; full lines keep their newline, partial lines never have one.
    pub content: Vec<u8>,
}

impl CriLogLine {
    /// Content without the trailing newline.
    #[must_use]
    pub fn text(&self) -> &[u8] {
        self.content.strip_suffix(&[EOL]).unwrap_or(&self.content)
    }

    /// Whether more of this line follows.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.tag == LogTag::Partial
    }
}

/// Parses one CRI formatted line.
pub fn parse_cri_log(line: &[u8]) -> Result<CriLogLine> {
    let (ts, rest) = split_field(line)
        .ok_or_else(|| CriError::parse("timestamp is not found"))?;
    let ts = std::str::from_utf8(ts)
        .map_err(|_| CriError::parse("timestamp is not valid UTF-8"))?;
    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map_err(|e| CriError::parse(format!("unexpected timestamp format {ts:?}: {e}")))?
        .with_timezone(&Utc);

    let (stream, rest) = split_field(rest)
        .ok_or_else(|| CriError::parse("stream type is not found"))?;
    let stream = match stream {
        b"stdout" => Source::Stdout,
        b"stderr" => Source::Stderr,
        other => {
            return Err(CriError::parse(format!(
                "unexpected stream type {:?}",
                String::from_utf8_lossy(other)
            )));
        }
    };

    let (tags, content) = split_field(rest)
        .ok_or_else(|| CriError::parse("log tag is not found"))?;
    let first = tags.split(|&b| b == TAG_DELIMITER).next().unwrap_or_default();
    let tag = if first == b"P" { LogTag::Partial } else { LogTag::Full };

    let mut content = content.to_vec();
    if tag == LogTag::Partial && content.last() == Some(&EOL) {
        content.pop();
    }

    Ok(CriLogLine {
        timestamp,
        stream,
        tag,
        content,
    })
}

/// Parses one docker JSON-lines record into the CRI shape.
///
/// A `log` value without a trailing newline is a fragment.
pub fn parse_docker_json_log(line: &[u8]) -> Result<CriLogLine> {
    let record: JsonLogRecord = serde_json::from_slice(line)
        .map_err(|e| CriError::parse(format!("invalid json log: {e}")))?;
    let content = record.log.into_bytes();
    let tag = if content.last() == Some(&EOL) {
        LogTag::Full
    } else {
        LogTag::Partial
    };
    Ok(CriLogLine {
        timestamp: record.time,
        stream: record.stream,
        tag,
        content,
    })
}

/// Format of a log file, detected from its first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// CRI text lines.
    Cri,
    /// Docker JSON lines.
    DockerJson,
}

impl LogFormat {
    /// Returns the first format that parses `line`.
    pub fn detect(line: &[u8]) -> Result<Self> {
        if parse_cri_log(line).is_ok() {
            return Ok(Self::Cri);
        }
        if parse_docker_json_log(line).is_ok() {
            return Ok(Self::DockerJson);
        }
        Err(CriError::parse(format!(
            "unsupported log format: {:?}",
            String::from_utf8_lossy(line)
        )))
    }

    /// Parses `line` in this format.
    pub fn parse(self, line: &[u8]) -> Result<CriLogLine> {
        match self {
            Self::Cri => parse_cri_log(line),
            Self::DockerJson => parse_docker_json_log(line),
        }
    }
}

fn split_field(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = data.iter().position(|&b| b == DELIMITER)?;
    Some((&data[..idx], &data[idx + 1..]))
}
