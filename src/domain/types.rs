//! Shared domain enumerations used by policies, storage tiers and logs.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// What to do when a cached value is missing or stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeMode {
    /// Never recompute; misses return the default.
    No,
    /// Recompute inline when missing or stale.
    #[default]
    Auto,
    /// Always recompute inline, ignoring cached values.
    Yes,
    /// Serve stale values while refreshing in the background.
    Defer,
    /// Like `Defer`, but misses also refresh in the background and return the default.
    #[serde(rename = "alwaysdefer")]
    AlwaysDefer,
    /// Read-only: return whatever is cached, never refresh.
    Lookup,
}

impl RecomputeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecomputeMode::No => "no",
            RecomputeMode::Auto => "auto",
            RecomputeMode::Yes => "yes",
            RecomputeMode::Defer => "defer",
            RecomputeMode::AlwaysDefer => "alwaysdefer",
            RecomputeMode::Lookup => "lookup",
        }
    }
}

impl fmt::Display for RecomputeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecomputeMode {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no" => Ok(RecomputeMode::No),
            "auto" => Ok(RecomputeMode::Auto),
            "yes" => Ok(RecomputeMode::Yes),
            "defer" => Ok(RecomputeMode::Defer),
            "alwaysdefer" => Ok(RecomputeMode::AlwaysDefer),
            "lookup" => Ok(RecomputeMode::Lookup),
            other => Err(DomainError::validation(format!(
                "unknown recompute mode `{other}`"
            ))),
        }
    }
}

/// How long a cached value stays valid after it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "ExpirySpec")]
pub enum Expiry {
    #[default]
    Never,
    After(Duration),
}

impl Expiry {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Expiry::Never => None,
            Expiry::After(duration) => Some(*duration),
        }
    }

    /// Parse `"90"`, `"45s"`, `"10m"`, `"1h"`, `"30d"` (fractions allowed, e.g. `"1.5h"`).
    ///
    /// An empty string means the value never expires.
    pub fn parse(spec: &str) -> Result<Self, DomainError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Expiry::Never);
        }

        let (number, multiplier) = match spec.char_indices().last() {
            Some((idx, 's')) => (&spec[..idx], 1.0),
            Some((idx, 'm')) => (&spec[..idx], 60.0),
            Some((idx, 'h')) => (&spec[..idx], 3_600.0),
            Some((idx, 'd')) => (&spec[..idx], 86_400.0),
            _ => (spec, 1.0),
        };

        let amount: f64 = number.trim().parse().map_err(|_| {
            DomainError::validation(format!("invalid expiry `{spec}`: expected <number>[s|m|h|d]"))
        })?;

        Duration::try_from_secs_f64(amount * multiplier)
            .map(Expiry::After)
            .map_err(|err| DomainError::validation(format!("invalid expiry `{spec}`: {err}")))
    }
}

impl FromStr for Expiry {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Expiry::parse(value)
    }
}

impl From<Duration> for Expiry {
    fn from(duration: Duration) -> Self {
        Expiry::After(duration)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpirySpec {
    Seconds(u64),
    Text(String),
}

impl TryFrom<ExpirySpec> for Expiry {
    type Error = DomainError;

    fn try_from(spec: ExpirySpec) -> Result<Self, Self::Error> {
        match spec {
            ExpirySpec::Seconds(seconds) => Ok(Expiry::After(Duration::from_secs(seconds))),
            ExpirySpec::Text(text) => Expiry::parse(&text),
        }
    }
}

/// Storage tier identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Volatile,
    Durable,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Volatile => "volatile",
            Tier::Durable => "durable",
        }
    }
}

/// Provenance of the value an invocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Volatile,
    Durable,
    Recomputed,
    None,
}

impl RecordSource {
    /// Status token written to the per-invocation log line.
    pub fn status(self) -> &'static str {
        match self {
            RecordSource::Volatile => "VOLATILE_HIT",
            RecordSource::Durable => "DURABLE_HIT",
            RecordSource::Recomputed => "RECOMPUTED",
            RecordSource::None => "MISS",
        }
    }
}

impl From<Tier> for RecordSource {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Volatile => RecordSource::Volatile,
            Tier::Durable => RecordSource::Durable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_expiry_units() {
        assert_eq!(Expiry::parse("90").unwrap(), Expiry::After(Duration::from_secs(90)));
        assert_eq!(Expiry::parse("45s").unwrap(), Expiry::After(Duration::from_secs(45)));
        assert_eq!(Expiry::parse("10m").unwrap(), Expiry::After(Duration::from_secs(600)));
        assert_eq!(Expiry::parse("1h").unwrap(), Expiry::After(Duration::from_secs(3_600)));
        assert_eq!(Expiry::parse("30d").unwrap(), Expiry::After(Duration::from_secs(2_592_000)));
        assert_eq!(Expiry::parse("1.5h").unwrap(), Expiry::After(Duration::from_secs(5_400)));
        assert_eq!(Expiry::parse("  ").unwrap(), Expiry::Never);
    }

    #[test]
    fn rejects_invalid_expiry() {
        assert!(Expiry::parse("soon").is_err());
        assert!(Expiry::parse("-5m").is_err());
        assert!(Expiry::parse("m").is_err());
    }

    #[test]
    fn expiry_deserializes_from_text_or_seconds() {
        let from_text: Expiry = serde_json::from_str("\"2h\"").unwrap();
        assert_eq!(from_text, Expiry::After(Duration::from_secs(7_200)));
        let from_number: Expiry = serde_json::from_str("30").unwrap();
        assert_eq!(from_number, Expiry::After(Duration::from_secs(30)));
    }

    #[test]
    fn recompute_mode_round_trips_names() {
        for mode in [
            RecomputeMode::No,
            RecomputeMode::Auto,
            RecomputeMode::Yes,
            RecomputeMode::Defer,
            RecomputeMode::AlwaysDefer,
            RecomputeMode::Lookup,
        ] {
            assert_eq!(mode.as_str().parse::<RecomputeMode>().unwrap(), mode);
        }
        assert_eq!("AlwaysDefer".parse::<RecomputeMode>().unwrap(), RecomputeMode::AlwaysDefer);
        assert!("sometimes".parse::<RecomputeMode>().is_err());
    }

    #[test]
    fn record_source_status_tokens() {
        assert_eq!(RecordSource::Recomputed.status(), "RECOMPUTED");
        assert_eq!(RecordSource::Volatile.status(), "VOLATILE_HIT");
        assert_eq!(RecordSource::Durable.status(), "DURABLE_HIT");
        assert_eq!(RecordSource::None.status(), "MISS");
    }
}
