//! On-disk format of the resolver config, before validation.
use std::{num::NonZeroUsize, time::Duration};

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// grace period before endpoints are dropped on discovery failure,
    /// absent means failures never invalidate endpoints
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub invalidate_on_error: Option<Duration>,
    #[serde(default)]
    pub retry: Retry,
    /// deadline for a whole call, across all attempts
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub discovery: Discovery,
}

/// either `max_attempts: N` or `forever: true`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    pub max_attempts: Option<NonZeroUsize>,
    #[serde(default)]
    pub forever: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Backoff {
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub floor: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub cap: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Discovery {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub passing_only: bool,
}

/// Parse a duration string with optional time units
/// Accepts: "250ms", "10", "10s", "5m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Seconds(val) => Ok(Duration::from_secs(val)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_duration)
        .transpose()
}
