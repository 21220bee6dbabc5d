//! A [`Duration`] which parses the human-readable formats used throughout
//! the SecretClass CRD and the volume context, like `24h`, `15d` or
//! `2h30m`. A bare decimal is interpreted as seconds.
//!
//! It implements [`std::ops::Deref`] to [`std::time::Duration`], so all
//! associated functions of the standard type stay available.
use std::{fmt, num::ParseIntError, ops::Deref, str::FromStr};

use schemars::{JsonSchema, gen::SchemaGenerator, schema::Schema};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Visitor};
use snafu::{OptionExt, ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display("empty duration"))]
    EmptyInput,

    #[snafu(display("failed to parse {value:?} as number"))]
    ParseValue {
        source: ParseIntError,
        value: String,
    },

    #[snafu(display("duration segment {segment:?} is missing a unit"))]
    MissingUnit { segment: String },

    #[snafu(display("unknown duration unit {unit:?}"))]
    UnknownUnit { unit: String },

    #[snafu(display("duration overflow"))]
    Overflow,
}

/// A duration parsed from a human-readable string like `24h` or `15d 2m`.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

const UNIT_FACTORS: [(&str, u64); 4] = [("s", 1), ("m", 60), ("h", 60 * 60), ("d", 24 * 60 * 60)];

impl FromStr for Duration {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        snafu::ensure!(!input.is_empty(), EmptyInputSnafu);

        // A bare decimal is a number of seconds.
        if input.chars().all(|c| c.is_ascii_digit()) {
            let seconds = input.parse::<u64>().context(ParseValueSnafu { value: input })?;
            return Ok(Self(std::time::Duration::from_secs(seconds)));
        }

        let mut total = std::time::Duration::ZERO;
        let mut chars = input.chars().peekable();

        while chars.peek().is_some() {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut value = String::new();
            while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
                value.push(c);
            }

            let mut unit = String::new();
            while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
                unit.push(c);
            }

            snafu::ensure!(!unit.is_empty(), MissingUnitSnafu { segment: value });
            let value = value
                .parse::<u64>()
                .context(ParseValueSnafu { value: value.clone() })?;

            let segment = match unit.as_str() {
                "ms" => std::time::Duration::from_millis(value),
                unit => {
                    let factor = UNIT_FACTORS
                        .iter()
                        .find(|(name, _)| *name == unit)
                        .map(|(_, factor)| *factor)
                        .context(UnknownUnitSnafu { unit })?;
                    std::time::Duration::from_secs(value.checked_mul(factor).context(OverflowSnafu)?)
                }
            };

            total = total.checked_add(segment).context(OverflowSnafu)?;
        }

        Ok(Self(total))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seconds = self.0.as_secs();
        let millis = self.0.subsec_millis();

        if seconds == 0 && millis == 0 {
            return write!(f, "0s");
        }

        for (unit, factor) in [("d", 24 * 60 * 60), ("h", 60 * 60), ("m", 60)] {
            let value = seconds / factor;
            if value > 0 {
                write!(f, "{value}{unit}")?;
                seconds %= factor;
            }
        }
        if seconds > 0 {
            write!(f, "{seconds}s")?;
        }
        if millis > 0 {
            write!(f, "{millis}ms")?;
        }

        Ok(())
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_hours(hours: u64) -> Self {
        Self::from_secs(hours * 60 * 60)
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a duration string like \"24h\" or \"15d 2m\"")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(DurationVisitor)
    }
}

impl JsonSchema for Duration {
    fn schema_name() -> String {
        "Duration".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        assert_eq!("24h".parse::<Duration>().unwrap(), Duration::from_hours(24));
        assert_eq!("360h".parse::<Duration>().unwrap(), Duration::from_hours(360));
        assert_eq!("15d".parse::<Duration>().unwrap(), Duration::from_hours(15 * 24));
        assert_eq!("90s".parse::<Duration>().unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn parse_compound() {
        assert_eq!(
            "2h30m".parse::<Duration>().unwrap(),
            Duration::from_secs(2 * 3600 + 30 * 60)
        );
        assert_eq!(
            "15d 2m 2s".parse::<Duration>().unwrap(),
            Duration::from_secs(15 * 24 * 3600 + 2 * 60 + 2)
        );
    }

    #[test]
    fn parse_bare_decimal_as_seconds() {
        assert_eq!("3600".parse::<Duration>().unwrap(), Duration::from_hours(1));
    }

    #[test]
    fn parse_invalid() {
        assert!("".parse::<Duration>().is_err());
        assert!("5x".parse::<Duration>().is_err());
        assert!("h".parse::<Duration>().is_err());
        assert!("2h3".parse::<Duration>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for input in ["24h", "15d2m2s", "1d1h1m1s", "0s", "500ms"] {
            let parsed = input.parse::<Duration>().unwrap();
            assert_eq!(parsed.to_string(), input);
            assert_eq!(parsed.to_string().parse::<Duration>().unwrap(), parsed);
        }
    }
}
