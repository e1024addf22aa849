use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::record::{DecodeError, Record, RAW_FIELD_COUNT};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed line: {0:?}")]
    MalformedLine(String),
    #[error("invalid field in line {line:?}: {source}")]
    InvalidField {
        line: String,
        #[source]
        source: DecodeError,
    },
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();

    PATTERN.get_or_init(|| Regex::new(r"^\s*\[[^\]]*\]: (?P<fields>.*)$").unwrap())
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();

    PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]+$").unwrap())
}

/// Decodes one line received from the concentrator, e.g.
/// `[hub]: 0x00124b000e09465a, -36, 19, 598, 2108, 9776121, 37770`.
pub fn parse_line(raw: &[u8]) -> Result<Record, ParseError> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let malformed = || ParseError::MalformedLine(line.to_string());

    if std::str::from_utf8(raw).is_err() {
        return Err(malformed());
    }

    let captures = line_pattern().captures(line).ok_or_else(malformed)?;
    let fields: Vec<&str> = captures["fields"].split(',').map(str::trim).collect();

    if fields.len() != RAW_FIELD_COUNT + 1 || !address_pattern().is_match(fields[0]) {
        return Err(malformed());
    }

    Record::decode_raw_fields(fields[0], &fields[1..]).map_err(|source| ParseError::InvalidField {
        line: line.to_string(),
        source,
    })
}
