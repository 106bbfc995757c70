//! Serde helpers for durations written as `"500ms"`, `"30s"`, `"10m"`, `"1h"` or `"1d"`.
//!
//! Use with `#[serde(with = "conveyor_types::duration_serde")]`, or the
//! [`option`] submodule for `Option<Duration>` fields.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = duration.as_secs();
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(val) = s.strip_suffix("ms") {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_millis(n))
    } else if let Some(val) = s.strip_suffix('s') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n))
    } else if let Some(val) = s.strip_suffix('m') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 60))
    } else if let Some(val) = s.strip_suffix('h') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 3600))
    } else if let Some(val) = s.strip_suffix('d') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 86400))
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}
