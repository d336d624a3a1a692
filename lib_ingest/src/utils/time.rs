use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y%m%d%H%M%S"];

/// Parses a field value as a point in time.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DD hh:mm:ss` style strings
/// interpreted in `tz`, and unix timestamps (seconds, or milliseconds when the
/// value is too large to be seconds) given as numbers or digit strings.
pub fn parse_timestamp(value: &Value, tz: Tz) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_unix),
        Value::String(s) => parse_str(s.trim(), tz),
        _ => None,
    }
}

fn parse_str(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if raw.len() != 14 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse::<i64>().ok().and_then(from_unix);
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    })
}

fn from_unix(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_common_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single();
        assert_eq!(parse_timestamp(&json!("2024-03-01T10:00:00Z"), Tz::UTC), expected);
        assert_eq!(parse_timestamp(&json!("2024-03-01 10:00:00"), Tz::UTC), expected);
        assert_eq!(parse_timestamp(&json!(1709287200), Tz::UTC), expected);
        assert_eq!(parse_timestamp(&json!("1709287200"), Tz::UTC), expected);
        assert_eq!(parse_timestamp(&json!(1709287200000i64), Tz::UTC), expected);
    }

    #[test]
    fn naive_strings_use_the_reader_timezone() {
        let parsed = parse_timestamp(&json!("2024-03-01 12:00:00"), chrono_tz::Europe::Bucharest);
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(&json!("yesterday"), Tz::UTC), None);
        assert_eq!(parse_timestamp(&json!(true), Tz::UTC), None);
        assert_eq!(parse_timestamp(&json!(""), Tz::UTC), None);
    }
}
