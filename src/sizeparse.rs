//! Byte-size parsing for configuration strings like `"100m"`, `"1.5g"`, `"512kb"`.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A parsed byte count, deserializable from strings like `"100m"` or `"1.5g"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty size string")]
    Empty,
    #[error("negative size is not allowed")]
    Negative,
    #[error("invalid number in size string")]
    InvalidNumber,
}

/// Parses a size string.
///
/// Grammar: an optional leading `-` (rejected), a decimal number, an optional
/// magnitude suffix (`k`, `m`, `g`, case-insensitive), and an optional
/// trailing `b`. `"100m"`, `"100mb"`, `"1.5g"`, `"512"` are all valid.
pub fn parse_size(input: &str) -> Result<u64, ParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    if s.starts_with('-') {
        return Err(ParseError::Negative);
    }

    let lower = s.to_ascii_lowercase();
    let body = lower.strip_suffix('b').unwrap_or(&lower);

    let (number_part, multiplier) = if let Some(n) = body.strip_suffix('k') {
        (n, 1024u64)
    } else if let Some(n) = body.strip_suffix('m') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = body.strip_suffix('g') {
        (n, 1024u64 * 1024 * 1024)
    } else {
        (body, 1u64)
    };

    let value: f64 = number_part
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumber)?;
    if value < 0.0 {
        return Err(ParseError::Negative);
    }

    Ok((value * multiplier as f64).round() as u64)
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = StringOrInt::deserialize(deserializer)?;
        let bytes = match raw {
            StringOrInt::String(s) => parse_size(&s).map_err(de::Error::custom)?,
            StringOrInt::Int(n) => n,
        };
        Ok(ByteSize(bytes))
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    String(String),
    Int(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_number() {
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn kilobytes() {
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_size("512KB").unwrap(), 512 * 1024);
    }

    #[test]
    fn megabytes() {
        assert_eq!(parse_size("100m").unwrap(), 100 * 1024 * 1024);
    }

    #[test]
    fn gigabytes_fractional() {
        assert_eq!(parse_size("1.5g").unwrap(), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(parse_size("-5m").unwrap_err(), ParseError::Negative);
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(parse_size("").unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("abc").is_err());
    }
}
