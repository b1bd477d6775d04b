//! On-disk record format: one JSON object per line.
//!
//! ```text
//! {"log":"hello\n","stream":"stdout","time":"2024-05-01T10:00:00.123456789Z"}
//! ```
//!
//! `log` keeps the line's newline; a record without one is a fragment of a
//! longer line.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rudder_logger::{Message, PartialLogMeta, Source};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct RecordRef<'a> {
    log: &'a str,
    stream: Source,
    time: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "no_attrs")]
    attrs: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial: Option<&'a PartialLogMeta>,
}

fn no_attrs(attrs: &&BTreeMap<String, String>) -> bool {
    attrs.is_empty()
}

/// A record as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonLogRecord {
    /// Line text, newline included for complete lines.
    pub log: String,
    /// Output stream.
    pub stream: Source,
    /// Capture time.
    pub time: DateTime<Utc>,
    /// Extra attributes.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Fragment metadata.
    #[serde(default)]
    pub partial: Option<PartialLogMeta>,
}

/// Encodes a record as a single JSON line, terminator included.
pub fn encode(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut log = String::from_utf8_lossy(&msg.line).into_owned();
    if !msg.is_partial() {
        log.push('\n');
    }

    let record = RecordRef {
        log: &log,
        stream: msg.source,
        time: &msg.timestamp,
        attrs: &msg.attrs,
        partial: msg.partial.as_ref(),
    };
    let mut buf = serde_json::to_vec(&record)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decodes one JSON line, without its terminator, into a message.
pub fn decode(line: &[u8]) -> Result<Message, serde_json::Error> {
    let record: JsonLogRecord = serde_json::from_slice(line)?;
    let mut log = record.log;
    if log.ends_with('\n') {
        log.pop();
    }

    Ok(Message {
        source: record.stream,
        timestamp: record.time,
        line: log.into_bytes(),
        attrs: record.attrs,
        partial: record.partial,
    })
}
