//! Timestamp parsing and formatting for record payloads and configuration.
//!
//! Payload timestamps are stored as text. Accepted inputs are RFC 3339 date-times, naive
//! date-times (read as UTC) and bare dates (read as midnight UTC).

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a timestamp from text, returning `None` if no accepted format matches.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a timestamp held in a JSON value. Only strings are accepted.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

/// Format a timestamp as RFC 3339 with a `Z` suffix.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Format the date part of a timestamp as `YYYY-MM-DD`.
pub fn format_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d").to_string()
}

/// Serde adapter for required timestamps in configuration documents.
pub mod serde_timestamp {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_timestamp(*timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_timestamp(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{text}'")))
    }
}

/// Serde adapter for optional timestamps in configuration documents.
pub mod serde_timestamp_opt {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => parse_timestamp(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{text}'"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_accepted_formats() {
        let date_only = parse_timestamp("2018-10-21").expect("date should parse");
        assert_eq!(format_timestamp(date_only), "2018-10-21T00:00:00Z");

        let naive = parse_timestamp("2021-02-01 13:30:00").expect("naive should parse");
        assert_eq!(naive.hour(), 13);

        let offset = parse_timestamp("2021-02-01T13:30:00+01:00").expect("rfc3339 should parse");
        assert_eq!(offset.hour(), 12);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_none());
        assert!(timestamp_from_value(&Value::from(20181021)).is_none());
    }

    #[test]
    fn formats_date_part() {
        let ts = parse_timestamp("1985-05-24T08:00:00Z").expect("parse");
        assert_eq!(format_date(ts), "1985-05-24");
    }
}
