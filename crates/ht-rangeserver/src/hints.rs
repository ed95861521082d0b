//! The per-range `hints` file (§6): a small text artifact read on startup so a range can reopen
//! its cell stores without a full directory listing. Missing or corrupt hints are a cache miss,
//! not a fatal error — callers should fall back to a directory scan rather than propagate the
//! parse error as a hard failure.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

/// The highest hints-file version this parser understands; anything newer is rejected outright
/// rather than guessed at.
pub const MAX_SUPPORTED_VERSION: u32 = 3;
const CURRENT_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum HintsParseError {
    #[error("hints file version {0} is newer than the highest supported version {MAX_SUPPORTED_VERSION}")]
    UnsupportedVersion(u32),

    #[error("hints file is missing a required field: {0}")]
    MissingField(&'static str),

    #[error("hints file has a malformed line: {0:?}")]
    MalformedLine(String),

    #[error("hints file field {field} has a non-integer value {value:?}")]
    BadInteger { field: &'static str, value: String },
}

/// Per-access-group slice of a hints file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGroupHints {
    pub latest_stored_revision: i64,
    pub disk_usage:             u64,
    pub files:                  Vec<String>,
}

/// The parsed contents of a range's `hints` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeHints {
    pub start_row:      Vec<u8>,
    pub end_row:        Option<Vec<u8>>,
    pub location:       String,
    pub access_groups:  BTreeMap<String, AccessGroupHints>,
}

impl RangeHints {
    /// Serializes to the text format described in §6. Row bytes are escaped so that control
    /// characters and the `\r`/`\n` line terminators can round-trip through the text format.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Version: {CURRENT_VERSION}");
        let _ = writeln!(out, "Start Row: {}", escape_row(&self.start_row));
        let _ = writeln!(
            out, "End Row: {}",
            self.end_row.as_deref().map(escape_row).unwrap_or_default(),
        );
        let _ = writeln!(out, "Location: {}", self.location);
        let _ = writeln!(out, "Access Groups: {{");
        for (name, ag) in &self.access_groups {
            let _ = writeln!(out, "  {name}: {{");
            let _ = writeln!(out, "    LatestStoredRevision: {}", ag.latest_stored_revision);
            let _ = writeln!(out, "    DiskUsage: {}", ag.disk_usage);
            let _ = writeln!(out, "    Files: {}", ag.files.join(" "));
            let _ = writeln!(out, "  }}");
        }
        let _ = writeln!(out, "}}");
        out
    }

    /// Parses the text format described in §6. Rejects unknown versions greater than
    /// [`MAX_SUPPORTED_VERSION`]; older versions are accepted (there is only one format so far,
    /// so versions 1-3 all parse identically).
    pub fn parse(text: &str) -> Result<Self, HintsParseError> {
        let mut lines = text.lines().peekable();

        let mut version = None;
        let mut start_row = None;
        let mut end_row = None;
        let mut location = None;

        while let Some(line) = lines.peek() {
            let trimmed = line.trim();
            if trimmed.starts_with("Access Groups") {
                break;
            }
            let line = lines.next().unwrap();
            let (key, value) = split_field(line)?;
            match key {
                "Version" => {
                    version = Some(value.parse::<u32>().map_err(|_err| HintsParseError::BadInteger {
                        field: "Version",
                        value: value.to_string(),
                    })?);
                }
                "Start Row" => start_row = Some(unescape_row(value)),
                "End Row" => end_row = if value.is_empty() { None } else { Some(unescape_row(value)) },
                "Location" => location = Some(value.to_string()),
                _ => return Err(HintsParseError::MalformedLine(line.to_string())),
            }
        }

        let version = version.ok_or(HintsParseError::MissingField("Version"))?;
        if version > MAX_SUPPORTED_VERSION {
            return Err(HintsParseError::UnsupportedVersion(version));
        }
        let start_row = start_row.ok_or(HintsParseError::MissingField("Start Row"))?;
        let location = location.ok_or(HintsParseError::MissingField("Location"))?;

        // Consume the "Access Groups: {" opener.
        match lines.next() {
            Some(line) if line.trim().starts_with("Access Groups") => {}
            Some(other) => return Err(HintsParseError::MalformedLine(other.to_string())),
            None => return Err(HintsParseError::MissingField("Access Groups")),
        }

        let mut access_groups = BTreeMap::new();
        loop {
            let Some(line) = lines.next() else {
                return Err(HintsParseError::MalformedLine("unterminated Access Groups block".into()));
            };
            let trimmed = line.trim();
            if trimmed == "}" {
                break;
            }
            let Some(name) = trimmed.strip_suffix(": {") else {
                return Err(HintsParseError::MalformedLine(line.to_string()));
            };
            let mut latest_stored_revision = None;
            let mut disk_usage = None;
            let mut files = Vec::new();
            loop {
                let Some(inner) = lines.next() else {
                    return Err(HintsParseError::MalformedLine("unterminated access group block".into()));
                };
                let inner_trimmed = inner.trim();
                if inner_trimmed == "}" {
                    break;
                }
                let (key, value) = split_field(inner)?;
                match key {
                    "LatestStoredRevision" => {
                        latest_stored_revision = Some(value.parse::<i64>().map_err(|_err| {
                            HintsParseError::BadInteger { field: "LatestStoredRevision", value: value.to_string() }
                        })?);
                    }
                    "DiskUsage" => {
                        disk_usage = Some(value.parse::<u64>().map_err(|_err| {
                            HintsParseError::BadInteger { field: "DiskUsage", value: value.to_string() }
                        })?);
                    }
                    "Files" => {
                        files = value.split_whitespace().map(str::to_string).collect();
                    }
                    _ => return Err(HintsParseError::MalformedLine(inner.to_string())),
                }
            }
            access_groups.insert(
                name.to_string(),
                AccessGroupHints {
                    latest_stored_revision: latest_stored_revision
                        .ok_or(HintsParseError::MissingField("LatestStoredRevision"))?,
                    disk_usage: disk_usage.ok_or(HintsParseError::MissingField("DiskUsage"))?,
                    files,
                },
            );
        }

        Ok(Self { start_row, end_row, location, access_groups })
    }
}

fn split_field(line: &str) -> Result<(&str, &str), HintsParseError> {
    let trimmed = line.trim();
    trimmed
        .split_once(':')
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| HintsParseError::MalformedLine(line.to_string()))
}

fn escape_row(row: &[u8]) -> String {
    let mut out = String::with_capacity(row.len());
    for &byte in row {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(byte as char),
            other => {
                let _ = write!(out, "\\x{other:02x}");
            }
        }
    }
    out
}

fn unescape_row(escaped: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c as u8);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push(b'\\'),
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(((hi << 4) | lo) as u8);
                }
            }
            Some(other) => out.push(other as u8),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{AccessGroupHints, RangeHints};
    use std::collections::BTreeMap;

    fn sample() -> RangeHints {
        let mut access_groups = BTreeMap::new();
        access_groups.insert(
            "default".to_string(),
            AccessGroupHints {
                latest_stored_revision: 42,
                disk_usage: 4096,
                files: vec!["cs0".to_string(), "cs1".to_string()],
            },
        );
        RangeHints {
            start_row: b"row-0000".to_vec(),
            end_row: Some(b"row-9999".to_vec()),
            location: "rs1".to_string(),
            access_groups,
        }
    }

    #[test]
    fn parse_of_serialize_round_trips() {
        let hints = sample();
        let text = hints.serialize();
        let parsed = RangeHints::parse(&text).unwrap();
        assert_eq!(parsed, hints);
    }

    #[test]
    fn unbounded_end_row_round_trips_as_none() {
        let mut hints = sample();
        hints.end_row = None;
        let text = hints.serialize();
        let parsed = RangeHints::parse(&text).unwrap();
        assert_eq!(parsed.end_row, None);
    }

    #[test]
    fn rejects_version_greater_than_three() {
        let text = "Version: 4\nStart Row: a\nEnd Row: \nLocation: rs1\nAccess Groups: {\n}\n";
        assert!(RangeHints::parse(text).is_err());
    }

    #[test]
    fn escapes_row_bytes_with_control_characters() {
        let mut hints = sample();
        hints.start_row = vec![0, 1, b'\\', b'\n'];
        let text = hints.serialize();
        let parsed = RangeHints::parse(&text).unwrap();
        assert_eq!(parsed.start_row, hints.start_row);
    }
}
