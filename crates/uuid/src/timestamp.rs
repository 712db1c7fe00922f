use crate::{ShardableUuid, UuidError, UuidResult};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::{fmt, str::FromStr};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3f";

/// A time-prefixed unique identifier.
///
/// Format: `YYYYMMDDTHHMMSS.mmmZ-<canonical_uuid>`
///
/// Example: `20260111T143522.045Z-550e8400e29b41d4a716446655440000`
///
/// Lexicographic order of the string form equals chronological order of the timestamp, which
/// lets append-only logs be listed in order straight from the filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimestampUuid {
    timestamp: DateTime<Utc>,
    uuid: ShardableUuid,
}

impl TimestampUuid {
    /// Generate a new identifier stamped with the current time.
    ///
    /// If `last` is provided the timestamp is strictly greater than `last`'s (bumped by 1 ms
    /// when the clock has not advanced). Call this under a lock to get a monotonic sequence.
    pub fn generate(last: Option<&TimestampUuid>) -> Self {
        let now = truncate_to_millis(Utc::now());

        let timestamp = match last {
            Some(prev) if now <= prev.timestamp => prev.timestamp + Duration::milliseconds(1),
            _ => now,
        };

        Self {
            timestamp,
            uuid: ShardableUuid::new(),
        }
    }

    /// Build an identifier for an event that happened at `timestamp`.
    ///
    /// Sub-millisecond precision is dropped so the value survives a round trip through its
    /// string form.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: truncate_to_millis(timestamp),
            uuid: ShardableUuid::new(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn uuid(&self) -> &ShardableUuid {
        &self.uuid
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

impl FromStr for TimestampUuid {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts_str, uuid_str) = s.split_once('-').ok_or_else(|| {
            UuidError::InvalidInput(format!("Invalid timestamp UID format: '{}'", s))
        })?;

        let ts_no_z = ts_str.strip_suffix('Z').ok_or_else(|| {
            UuidError::InvalidInput(format!("Timestamp must end with 'Z': '{}'", ts_str))
        })?;

        let naive = NaiveDateTime::parse_from_str(ts_no_z, TIMESTAMP_FORMAT).map_err(|e| {
            UuidError::InvalidInput(format!("Invalid timestamp format '{}': {}", ts_str, e))
        })?;

        Ok(Self {
            timestamp: DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc),
            uuid: ShardableUuid::parse(uuid_str)?,
        })
    }
}

impl fmt::Display for TimestampUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Z-{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.uuid
        )
    }
}

impl TimestampUuid {
    pub fn parse(input: &str) -> UuidResult<Self> {
        input.parse()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for TimestampUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for TimestampUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_strictly_monotonic_without_sleep() {
        let first = TimestampUuid::generate(None);
        let second = TimestampUuid::generate(Some(&first));
        let third = TimestampUuid::generate(Some(&second));

        assert!(second.timestamp() > first.timestamp());
        assert!(third.timestamp() > second.timestamp());
        assert!(third.to_string() > first.to_string());
    }

    #[test]
    fn test_parse_and_display_agree() {
        let raw = "20260111T143522.045Z-550e8400e29b41d4a716446655440000";
        let parsed = TimestampUuid::parse(raw).unwrap();

        assert_eq!(parsed.to_string(), raw);
        assert_eq!(
            parsed.uuid().to_string(),
            "550e8400e29b41d4a716446655440000"
        );
    }

    #[test]
    fn test_parse_errors_name_the_problem() {
        let missing_sep = TimestampUuid::parse("20260111T143522.045Z550e8400e29b41d4a716446655440000");
        assert!(matches!(missing_sep, Err(UuidError::InvalidInput(m)) if m.contains("format")));

        let missing_z = TimestampUuid::parse("20260111T143522.045-550e8400e29b41d4a716446655440000");
        assert!(matches!(missing_z, Err(UuidError::InvalidInput(m)) if m.contains("'Z'")));

        let bad_month = TimestampUuid::parse("20261311T143522.045Z-550e8400e29b41d4a716446655440000");
        assert!(bad_month.is_err());
    }

    #[test]
    fn test_at_truncates_to_millis() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let id = TimestampUuid::at(ts);

        assert_eq!(id.timestamp().timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(TimestampUuid::parse(&id.to_string()).unwrap(), id);
    }
}
