//! Small helpers shared by the mqttd crates.
//!
//! - [`Bytesize`]: `"1M"`, `"512K"`, `"3G"` style sizes used in settings
//! - [`parse_duration`] and the serde helpers built on it: `"5s"`, `"2m"`, `"500ms"`
//! - millisecond timestamps via [`timestamp_millis`]
//! - [`Counter`]: current/max pair for broker statistics
//!
//! ```
//! use std::time::Duration;
//! use mqttd_utils::{parse_duration, Bytesize};
//!
//! let size: Bytesize = "1M".parse().unwrap();
//! assert_eq!(size.as_usize(), 1_048_576);
//! assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1_048_576;
const BYTESIZE_G: usize = 1_073_741_824;

/// A byte count parsed from strings such as `"3G"` or `"2G512M"`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Largest-unit-first rendering, `Bytesize(2148532224)` is `"2G1M"`.
    pub fn string(&self) -> String {
        let mut v = self.0;
        if v == 0 {
            return "0B".into();
        }
        let mut res = String::new();
        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K), ('B', 1)] {
            let n = v / size;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                v %= size;
            }
        }
        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl FromStr for Bytesize {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
        if text.is_empty() {
            return Err(anyhow!("empty byte size"));
        }
        if let Ok(v) = text.parse::<usize>() {
            return Ok(Bytesize(v));
        }
        let mut total = 0usize;
        for part in text.split_inclusive(['G', 'M', 'K', 'B']) {
            let (num, unit) = split_unit(part);
            let n = num.parse::<usize>().map_err(|_| anyhow!("invalid byte size: {:?}", text))?;
            let size = match unit {
                "G" => BYTESIZE_G,
                "M" => BYTESIZE_M,
                "K" => BYTESIZE_K,
                "B" => 1,
                _ => return Err(anyhow!("invalid byte size unit: {:?}", text)),
            };
            total = n
                .checked_mul(size)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| anyhow!("byte size overflow: {:?}", text))?;
        }
        Ok(Bytesize(total))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Bytesize(n as usize)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Parses durations such as `"5s"`, `"1h30m"`, `"500ms"` or `"2d"`.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number is seconds.
pub fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    // `ms` is the only two-letter unit, fold it into a placeholder
    let text = text.replace("ms", "Y");
    let mut millis = 0u64;
    for part in text.split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y']) {
        let (num, unit) = split_unit(part);
        let n = num.parse::<u64>().map_err(|_| anyhow!("invalid duration: {:?}", text))?;
        let scale = match unit {
            "Y" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return Err(anyhow!("invalid duration unit: {:?}", text)),
        };
        millis = millis.saturating_add(n.saturating_mul(scale));
    }
    Ok(Duration::from_millis(millis))
}

#[inline]
fn split_unit(part: &str) -> (&str, &str) {
    match part.char_indices().last() {
        Some((idx, _)) => part.split_at(idx),
        None => (part, ""),
    }
}

/// Deserialize a [`Duration`] from its human-readable form.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    parse_duration(&v).map_err(serde::de::Error::custom)
}

/// Like [`deserialize_duration`], with zero and empty strings meaning `None`.
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.is_empty() {
        return Ok(None);
    }
    let d = parse_duration(&v).map_err(serde::de::Error::custom)?;
    Ok(if d.is_zero() { None } else { Some(d) })
}

/// Current time in milliseconds since the Unix epoch.
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Formats a millisecond timestamp as local time, empty for non-positive input.
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    use chrono::TimeZone;
    if t <= 0 {
        return String::new();
    }
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1M", 1_048_576; "mega")]
    #[test_case("512K", 524_288; "kilo")]
    #[test_case("3G", 3_221_225_472; "giga")]
    #[test_case("2G512M", 2_684_354_560; "mixed")]
    #[test_case("1mb", 1_048_576; "lowercase suffix")]
    #[test_case("100", 100; "bare number")]
    fn test_bytesize(text: &str, expected: usize) {
        assert_eq!(text.parse::<Bytesize>().unwrap().as_usize(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("12X"; "unknown unit")]
    #[test_case("M"; "no number")]
    fn test_bytesize_invalid(text: &str) {
        assert!(text.parse::<Bytesize>().is_err());
    }

    #[test]
    fn test_bytesize_string() {
        assert_eq!(Bytesize(3 * BYTESIZE_M).string(), "3M");
        assert_eq!(Bytesize(2_148_532_224).string(), "2G1M");
        assert_eq!(Bytesize(0).string(), "0B");
    }

    #[test_case("5s", 5_000; "seconds")]
    #[test_case("2m", 120_000; "minutes")]
    #[test_case("2h", 7_200_000; "hours")]
    #[test_case("500ms", 500; "millis")]
    #[test_case("1m30s", 90_000; "mixed")]
    #[test_case("30", 30_000; "bare seconds")]
    fn test_parse_duration(text: &str, millis: u64) {
        assert_eq!(parse_duration(text).unwrap(), Duration::from_millis(millis));
    }

    #[test_case("abc"; "garbage")]
    #[test_case("5x"; "unknown unit")]
    #[test_case(""; "empty")]
    fn test_parse_duration_invalid(text: &str) {
        assert!(parse_duration(text).is_err());
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Conf {
            #[serde(deserialize_with = "deserialize_duration")]
            interval: Duration,
            #[serde(deserialize_with = "deserialize_duration_option")]
            expiry: Option<Duration>,
            size: Bytesize,
        }
        let conf: Conf =
            serde_json::from_str(r#"{"interval": "5s", "expiry": "0s", "size": "512K"}"#).unwrap();
        assert_eq!(conf.interval, Duration::from_secs(5));
        assert_eq!(conf.expiry, None);
        assert_eq!(conf.size, Bytesize(512 * 1024));

        let res = serde_json::from_str::<Conf>(r#"{"interval": "soon", "expiry": "", "size": 1}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_timestamp() {
        let now = timestamp_millis();
        assert!(now > 1_600_000_000_000);
        assert!(!format_timestamp_millis(now).is_empty());
        assert!(format_timestamp_millis(0).is_empty());
    }
}
