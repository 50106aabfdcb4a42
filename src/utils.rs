/// Utility functions for timestamps and record text handling
use time::macros::format_description;
use time::OffsetDateTime;

/// 100 ns ticks per second
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Key whose values get rewritten when a record's capture time is corrected
const TIMESTAMP_KEY: &str = "\"iso_timestamp\"";

/// Current wall clock in 100 ns ticks since the Unix epoch
pub fn now_ticks() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 100) as i64
}

fn datetime_from_ticks(ticks: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ticks as i128 * 100)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// ISO-8601 UTC form used in the record schema, e.g. `2024-03-01T12:00:00+00:00`
pub fn iso_timestamp(ticks: i64) -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]+00:00");
    let dt = datetime_from_ticks(ticks);
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format a tick count for human-readable logging
///
/// Converts to DD.MM.YYYY - HH:MM:SS format.
pub fn format_datetime(ticks: i64) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    let dt = datetime_from_ticks(ticks);
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Round a reading to the precision it is reported with
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Replace the value of every `"iso_timestamp"` field in a JSON text
///
/// This is a textual patch: only the quoted string after each key changes,
/// the surrounding structure and formatting are copied through untouched.
/// Returns `None` if a key is not followed by a string value.
pub fn patch_timestamps(json: &str, new_timestamp: &str) -> Option<String> {
    let mut patched = String::with_capacity(json.len());
    let mut rest = json;

    while let Some(found) = rest.find(TIMESTAMP_KEY) {
        let after_key = found + TIMESTAMP_KEY.len();
        let tail = &rest[after_key..];

        // Skip `:` and any whitespace up to the opening quote
        let value_start = tail.find('"')?;
        if tail[..value_start].trim() != ":" {
            return None;
        }
        let value_len = tail[value_start + 1..].find('"')?;

        patched.push_str(&rest[..after_key + value_start + 1]);
        patched.push_str(new_timestamp);
        rest = &tail[value_start + 1 + value_len..];
    }

    patched.push_str(rest);
    Some(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_format_as_iso_utc() {
        assert_eq!(iso_timestamp(0), "1970-01-01T00:00:00+00:00");
        assert_eq!(
            iso_timestamp(1_709_294_400 * TICKS_PER_SECOND + 5),
            "2024-03-01T12:00:00+00:00"
        );
        assert_eq!(format_datetime(0), "01.01.1970 - 00:00:00");
    }

    #[test]
    fn patch_replaces_only_timestamp_values() {
        let json = r#"{"iso_timestamp":"1970-01-01T00:00:00+00:00","measurements":[{"sensor_id":3,"iso_timestamp" : "1970-01-01T00:00:00+00:00","value":21.5}]}"#;

        let patched = patch_timestamps(json, "2024-03-01T12:00:00+00:00").unwrap();

        assert_eq!(
            patched,
            r#"{"iso_timestamp":"2024-03-01T12:00:00+00:00","measurements":[{"sensor_id":3,"iso_timestamp" : "2024-03-01T12:00:00+00:00","value":21.5}]}"#
        );
    }

    #[test]
    fn patch_rejects_non_string_timestamp() {
        assert_eq!(patch_timestamps(r#"{"iso_timestamp": 12, "x": "y"}"#, "z"), None);
        assert_eq!(patch_timestamps("{}", "z").as_deref(), Some("{}"));
    }

    #[test]
    fn rounding_uses_reported_precision() {
        assert_eq!(round_to(21.456, 2), 21.46);
        assert_eq!(round_to(-0.12345, 3), -0.123);
    }
}
