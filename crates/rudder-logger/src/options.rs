//! Driver options understood by every driver.
//!
//! Options arrive as a flat key/value map at container start. `mode` and
//! `max-buffer-size` are interpreted here; all other keys belong to the
//! selected driver.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{LoggerError, Result};

/// Option selecting blocking or non-blocking delivery.
pub const MODE_KEY: &str = "mode";
/// Option bounding the non-blocking ring buffer.
pub const MAX_BUFFER_SIZE_KEY: &str = "max-buffer-size";
/// Ring buffer size used when `max-buffer-size` is not given.
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 1024 * 1024;

/// Options every driver accepts.
pub const GENERIC_OPTIONS: &[&str] = &[MODE_KEY, MAX_BUFFER_SIZE_KEY];

/// Delivery mode between the capture loop and the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// No mode given; same as blocking.
    #[default]
    Unset,
    /// The producer waits for the driver.
    Blocking,
    /// The producer never waits; excess records are dropped.
    NonBlocking,
}

impl LogMode {
    /// Parses the `mode` option value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" => Ok(Self::Unset),
            "blocking" => Ok(Self::Blocking),
            "non-blocking" => Ok(Self::NonBlocking),
            other => Err(LoggerError::invalid_option(
                MODE_KEY,
                format!("logging mode not supported: {other}"),
            )),
        }
    }

    /// Reads the mode out of a driver option map.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        options
            .get(MODE_KEY)
            .map_or(Ok(Self::Unset), |v| Self::parse(v))
    }

    /// Returns the option spelling of this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Blocking => "blocking",
            Self::NonBlocking => "non-blocking",
        }
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static BYTE_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([kmgtp])?(?:i?b)?\s*$")
        .unwrap_or_else(|_| unreachable!("byte size pattern is valid"))
});

/// Parses a human byte size such as `512k`, `10m` or `1.5GiB`.
///
/// Units are binary: `1k` is 1024 bytes.
pub fn parse_byte_size(value: &str) -> std::result::Result<u64, String> {
    let caps = BYTE_SIZE
        .captures(value)
        .ok_or_else(|| format!("invalid size: {value:?}"))?;

    let number: f64 = caps[1]
        .parse()
        .map_err(|_| format!("invalid size: {value:?}"))?;

    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(unit) => match unit.as_str() {
            "k" => 1 << 10,
            "m" => 1 << 20,
            "g" => 1 << 30,
            "t" => 1 << 40,
            _ => 1 << 50,
        },
    };

    Ok((number * multiplier as f64) as u64)
}

/// Parses a byte-size option, naming the key in the error.
pub fn byte_size_option(key: &str, value: &str) -> Result<u64> {
    parse_byte_size(value).map_err(|reason| LoggerError::invalid_option(key, reason))
}

/// Parses a boolean option (`true`/`false`, `1`/`0`).
pub fn bool_option(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" | "" => Ok(false),
        _ => Err(LoggerError::invalid_option(
            key,
            format!("expected a boolean, got {value:?}"),
        )),
    }
}

/// Parses a strictly positive integer option.
pub fn positive_option(key: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(LoggerError::invalid_option(
            key,
            format!("must be a positive integer, got {value:?}"),
        )),
    }
}

/// Validates `mode` and `max-buffer-size`.
///
/// Returns the parsed mode and, in non-blocking mode, the buffer bound.
pub fn validate_generic(options: &HashMap<String, String>) -> Result<(LogMode, Option<u64>)> {
    let mode = LogMode::from_options(options)?;

    let buffer = match options.get(MAX_BUFFER_SIZE_KEY) {
        Some(value) => {
            if mode != LogMode::NonBlocking {
                return Err(LoggerError::invalid_option(
                    MAX_BUFFER_SIZE_KEY,
                    "only supported with 'mode=non-blocking'",
                ));
            }
            let size = byte_size_option(MAX_BUFFER_SIZE_KEY, value)?;
            if size == 0 {
                return Err(LoggerError::invalid_option(
                    MAX_BUFFER_SIZE_KEY,
                    "must be greater than zero",
                ));
            }
            Some(size)
        }
        None if mode == LogMode::NonBlocking => Some(DEFAULT_MAX_BUFFER_SIZE),
        None => None,
    };

    Ok((mode, buffer))
}

/// Returns a copy of the options without the generic keys.
#[must_use]
pub fn driver_specific(options: &HashMap<String, String>) -> HashMap<String, String> {
    options
        .iter()
        .filter(|(k, _)| !GENERIC_OPTIONS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_case("0", 0)]
    #[test_case("42", 42)]
    #[test_case("1k", 1024)]
    #[test_case("1K", 1024)]
    #[test_case("10m", 10 * 1024 * 1024)]
    #[test_case("10MB", 10 * 1024 * 1024)]
    #[test_case("2MiB", 2 * 1024 * 1024)]
    #[test_case("1.5k", 1536)]
    #[test_case("1g", 1024 * 1024 * 1024)]
    fn parses_byte_sizes(input: &str, expected: u64) {
        assert_eq!(parse_byte_size(input), Ok(expected));
    }

    #[test_case("")]
    #[test_case("k")]
    #[test_case("-1m")]
    #[test_case("10 furlongs")]
    fn rejects_bad_byte_sizes(input: &str) {
        assert!(parse_byte_size(input).is_err());
    }

    #[test_case(&[], LogMode::Unset, None; "nothing set")]
    #[test_case(&[("mode", "blocking")], LogMode::Blocking, None; "blocking")]
    #[test_case(&[("mode", "non-blocking")], LogMode::NonBlocking, Some(DEFAULT_MAX_BUFFER_SIZE); "non-blocking default buffer")]
    #[test_case(&[("mode", "non-blocking"), ("max-buffer-size", "4m")], LogMode::NonBlocking, Some(4 * 1024 * 1024); "non-blocking sized")]
    fn accepts_generic_options(pairs: &[(&str, &str)], mode: LogMode, buffer: Option<u64>) {
        let (got_mode, got_buffer) = validate_generic(&opts(pairs)).expect("valid");
        assert_eq!(got_mode, mode);
        assert_eq!(got_buffer, buffer);
    }

    #[test_case(&[("mode", "fast")]; "unknown mode")]
    #[test_case(&[("max-buffer-size", "1m")]; "buffer without mode")]
    #[test_case(&[("mode", "blocking"), ("max-buffer-size", "1m")]; "buffer with blocking")]
    #[test_case(&[("mode", "non-blocking"), ("max-buffer-size", "lots")]; "unparseable buffer")]
    #[test_case(&[("mode", "non-blocking"), ("max-buffer-size", "0")]; "zero buffer")]
    fn rejects_generic_options(pairs: &[(&str, &str)]) {
        assert!(validate_generic(&opts(pairs)).is_err());
    }

    proptest! {
        #[test]
        fn whole_sizes_scale_by_unit(
            n in 0u64..1_000_000,
            unit in prop::sample::select(vec![("", 0u32), ("k", 10), ("M", 20), ("g", 30)]),
            suffix in prop::sample::select(vec!["", "b", "B", "ib", "iB"]),
        ) {
            let (letter, shift) = unit;
            let suffix = if letter.is_empty() { "" } else { suffix };
            prop_assert_eq!(parse_byte_size(&format!("{n}{letter}{suffix}")), Ok(n << shift));
        }

        #[test]
        fn never_panics(input in "\\PC{0,24}") {
            let _ = parse_byte_size(&input);
        }
    }

    #[test]
    fn driver_specific_strips_generic_keys() {
        let all = opts(&[("mode", "non-blocking"), ("max-size", "10m")]);
        let rest = driver_specific(&all);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest.get("max-size").map(String::as_str), Some("10m"));
    }

    #[test]
    fn bool_and_positive_options() {
        assert!(bool_option("compress", "true").expect("bool"));
        assert!(!bool_option("compress", "false").expect("bool"));
        assert!(bool_option("compress", "maybe").is_err());

        assert_eq!(positive_option("max-file", "3").expect("int"), 3);
        assert!(positive_option("max-file", "0").is_err());
        assert!(positive_option("max-file", "x").is_err());
    }
}
