//! 設定值單位解析：記憶體大小 ("1024M") 與時間長度 ("7d")。

use crate::utils::error::{Result, SendoutError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(i64),
    Text(String),
}

/// Memory budget per batch. `None` means unlimited (`-1` in config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "i64")]
pub struct MemoryLimit(pub Option<u64>);

impl MemoryLimit {
    pub fn bytes(&self) -> Option<u64> {
        self.0
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        MemoryLimit(Some(1024 * 1024 * 1024))
    }
}

impl TryFrom<RawValue> for MemoryLimit {
    type Error = SendoutError;

    fn try_from(raw: RawValue) -> Result<Self> {
        match raw {
            RawValue::Number(n) if n < 0 => Ok(MemoryLimit(None)),
            RawValue::Number(n) => Ok(MemoryLimit(Some(n as u64))),
            RawValue::Text(text) => parse_memory_limit(&text).map(MemoryLimit),
        }
    }
}

impl From<MemoryLimit> for i64 {
    fn from(limit: MemoryLimit) -> i64 {
        limit.0.map(|b| b as i64).unwrap_or(-1)
    }
}

/// Parses `-1`, plain bytes or a `K`/`M`/`G` shorthand.
pub fn parse_memory_limit(text: &str) -> Result<Option<u64>> {
    let trimmed = text.trim();
    if trimmed == "-1" {
        return Ok(None);
    }

    let upper = trimmed.to_ascii_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1024),
        Some('M') => (&upper[..upper.len() - 1], 1024 * 1024),
        Some('G') => (&upper[..upper.len() - 1], 1024 * 1024 * 1024),
        _ => (upper, 1),
    };

    let n = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| SendoutError::InvalidConfigValueError {
            field: "batch.memory_limit".to_string(),
            value: text.to_string(),
            reason: "Expected bytes, a K/M/G shorthand or -1".to_string(),
        })?;
    n.checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| SendoutError::InvalidConfigValueError {
            field: "batch.memory_limit".to_string(),
            value: text.to_string(),
            reason: "Value is too large".to_string(),
        })
}

/// A whole number of seconds, written either as a number or with a
/// `s`/`m`/`h`/`d`/`w` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "i64")]
pub struct Seconds(pub u64);

impl Seconds {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<RawValue> for Seconds {
    type Error = SendoutError;

    fn try_from(raw: RawValue) -> Result<Self> {
        match raw {
            RawValue::Number(n) if n < 0 => Err(SendoutError::InvalidConfigValueError {
                field: "duration".to_string(),
                value: n.to_string(),
                reason: "Durations cannot be negative".to_string(),
            }),
            RawValue::Number(n) => Ok(Seconds(n as u64)),
            RawValue::Text(text) => parse_duration_secs(&text).map(Seconds),
        }
    }
}

impl From<Seconds> for i64 {
    fn from(seconds: Seconds) -> i64 {
        seconds.0 as i64
    }
}

pub fn parse_duration_secs(text: &str) -> Result<u64> {
    let trimmed = text.trim().to_ascii_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        Some('d') => (&trimmed[..trimmed.len() - 1], 86_400),
        Some('w') => (&trimmed[..trimmed.len() - 1], 604_800),
        _ => (trimmed.as_str(), 1),
    };

    let n = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| SendoutError::InvalidConfigValueError {
            field: "duration".to_string(),
            value: text.to_string(),
            reason: "Expected seconds or a number with s/m/h/d/w".to_string(),
        })?;
    n.checked_mul(multiplier)
        .ok_or_else(|| SendoutError::InvalidConfigValueError {
            field: "duration".to_string(),
            value: text.to_string(),
            reason: "Duration is too large".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("1024M").unwrap(), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512k").unwrap(), Some(512 * 1024));
        assert_eq!(parse_memory_limit("2GB").unwrap(), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("4096").unwrap(), Some(4096));
        assert_eq!(parse_memory_limit("-1").unwrap(), None);
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("90").unwrap(), 90);
        assert_eq!(parse_duration_secs("30m").unwrap(), 1800);
        assert_eq!(parse_duration_secs("7d").unwrap(), 604_800);
        assert!(parse_duration_secs("soon").is_err());
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        // 乘上單位後超出 u64 範圍
        assert!(matches!(
            parse_memory_limit("20000000000G"),
            Err(SendoutError::InvalidConfigValueError { .. })
        ));
        assert!(matches!(
            parse_duration_secs("40000000000000w"),
            Err(SendoutError::InvalidConfigValueError { .. })
        ));
        assert_eq!(parse_memory_limit("16G").unwrap(), Some(16 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_numeric_forms() {
        #[derive(Deserialize)]
        struct Holder {
            limit: MemoryLimit,
            wait: Seconds,
        }

        let holder: Holder = toml::from_str("limit = -1\nwait = 15").unwrap();
        assert_eq!(holder.limit, MemoryLimit(None));
        assert_eq!(holder.wait, Seconds(15));

        let holder: Holder = toml::from_str("limit = \"256M\"\nwait = \"1h\"").unwrap();
        assert_eq!(holder.limit.bytes(), Some(256 * 1024 * 1024));
        assert_eq!(holder.wait.as_duration(), Duration::from_secs(3600));
    }
}
