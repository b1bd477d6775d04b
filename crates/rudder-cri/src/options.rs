//! Options of one CRI log request.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Log request options as they arrive from the API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodLogOptions {
    /// Keep streaming new lines.
    pub follow: bool,
    /// Only lines newer than this many seconds before now.
    pub since_seconds: Option<i64>,
    /// Only lines at or after this time.
    pub since_time: Option<DateTime<Utc>>,
    /// Prefix each line with its timestamp.
    pub timestamps: bool,
    /// Number of lines from the end to start at.
    pub tail_lines: Option<i64>,
    /// Stop after this many bytes of output.
    pub limit_bytes: Option<i64>,
}

/// Resolved options used by [`read_logs`](crate::read_logs) and
/// [`write_logs`](crate::write_logs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Lines from the end to start at; negative means the whole file.
    pub tail: i64,
    /// Output byte limit; negative means unlimited.
    pub bytes: i64,
    /// Lines older than this are skipped.
    pub since: Option<DateTime<Utc>>,
    /// Keep streaming while the container runs.
    pub follow: bool,
    /// Prefix output lines with their timestamp.
    pub timestamp: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: -1,
            bytes: -1,
            since: None,
            follow: false,
            timestamp: false,
        }
    }
}

impl LogOptions {
    /// Resolves API options against `now`.
    ///
    /// When both `since_seconds` and `since_time` are set, the later of the
    /// two wins.
    #[must_use]
    pub fn new(api: &PodLogOptions, now: DateTime<Utc>) -> Self {
        let mut opts = Self {
            follow: api.follow,
            timestamp: api.timestamps,
            ..Self::default()
        };
        if let Some(tail) = api.tail_lines {
            opts.tail = tail;
        }
        if let Some(bytes) = api.limit_bytes {
            opts.bytes = bytes;
        }
        if let Some(secs) = api.since_seconds {
            opts.since = Some(now - Duration::seconds(secs));
        }
        if let Some(time) = api.since_time {
            if opts.since.is_none_or(|since| time > since) {
                opts.since = Some(time);
            }
        }
        opts
    }

    /// Whether a record at `timestamp` is older than `since`.
    #[must_use]
    pub fn is_before_since(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.is_some_and(|since| timestamp < since)
    }

    /// Whether reading stops after `tail` records.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.tail >= 0 && !self.follow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("time")
    }

    #[test]
    fn defaults_are_unlimited() {
        let opts = LogOptions::new(&PodLogOptions::default(), now());
        assert_eq!(opts, LogOptions::default());
        assert_eq!(opts.tail, -1);
        assert_eq!(opts.bytes, -1);
        assert!(!opts.is_limited());
    }

    #[test]
    fn copies_limits_and_flags() {
        let api = PodLogOptions {
            follow: true,
            timestamps: true,
            tail_lines: Some(10),
            limit_bytes: Some(4096),
            ..PodLogOptions::default()
        };
        let opts = LogOptions::new(&api, now());
        assert_eq!(opts.tail, 10);
        assert_eq!(opts.bytes, 4096);
        assert!(opts.follow && opts.timestamp);
        assert!(!opts.is_limited());
    }

    #[test]
    fn since_seconds_is_relative_to_now() {
        let api = PodLogOptions {
            since_seconds: Some(60),
            ..PodLogOptions::default()
        };
        let opts = LogOptions::new(&api, now());
        assert_eq!(opts.since, Some(now() - Duration::seconds(60)));
        assert!(opts.is_before_since(now() - Duration::seconds(61)));
        assert!(!opts.is_before_since(now()));
    }

    #[test]
    fn later_since_wins() {
        let later = now() - Duration::seconds(10);
        let api = PodLogOptions {
            since_seconds: Some(60),
            since_time: Some(later),
            ..PodLogOptions::default()
        };
        assert_eq!(LogOptions::new(&api, now()).since, Some(later));

        let earlier = now() - Duration::seconds(600);
        let api = PodLogOptions {
            since_seconds: Some(60),
            since_time: Some(earlier),
            ..PodLogOptions::default()
        };
        assert_eq!(
            LogOptions::new(&api, now()).since,
            Some(now() - Duration::seconds(60))
        );
    }

    #[test]
    fn deserializes_api_json() {
        let api: PodLogOptions =
            serde_json::from_str(r#"{"follow":true,"tailLines":5,"limitBytes":100}"#)
                .expect("json");
        assert!(api.follow);
        assert_eq!(api.tail_lines, Some(5));
        assert_eq!(api.limit_bytes, Some(100));
        assert_eq!(api.since_time, None);
    }
}
