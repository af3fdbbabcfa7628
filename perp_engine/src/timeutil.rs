/// timeutil.rs — Timeframe strings and UTC time conversion
///
/// Timeframes are stored as raw milliseconds everywhere inside the engine;
/// strings like "1m"/"4h"/"1w" only appear at the configuration boundary and
/// in logs. `1M` uses a fixed 30-day month and exists purely so that
/// `format_timeframe(parse_timeframe(s)) == s`; month arithmetic on the
/// timeline (the progress log boundary) uses real calendar months instead.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};

use crate::error::{EngineError, Result};

pub const MS_SECOND: i64 = 1_000;
pub const MS_MINUTE: i64 = 60 * MS_SECOND;
pub const MS_HOUR: i64 = 60 * MS_MINUTE;
pub const MS_DAY: i64 = 24 * MS_HOUR;
pub const MS_WEEK: i64 = 7 * MS_DAY;
/// 30-day month, format round-trips only.
pub const MS_MONTH: i64 = 30 * MS_DAY;

/// Parse a timeframe string ("500ms", "30s", "15m", "4h", "1d", "1w", "1M")
/// into milliseconds.
pub fn parse_timeframe(timeframe: &str) -> Result<i64> {
    let s = timeframe.trim();

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) if pos > 0 => s.split_at(pos),
        _ => {
            return Err(EngineError::invalid(format!(
                "timeframe [{s}] must be <number><unit>"
            )))
        }
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| EngineError::invalid(format!("timeframe [{s}] has a bad number part")))?;
    if value <= 0 {
        return Err(EngineError::invalid(format!(
            "timeframe [{s}] must be positive"
        )));
    }

    let unit_ms = match unit {
        "ms" => 1,
        "s" => MS_SECOND,
        "m" => MS_MINUTE,
        "h" => MS_HOUR,
        "d" => MS_DAY,
        "w" => MS_WEEK,
        "M" => MS_MONTH,
        other => {
            return Err(EngineError::invalid(format!(
                "timeframe [{s}] has unknown unit [{other}] (expected ms, s, m, h, d, w, M)"
            )))
        }
    };

    Ok(value * unit_ms)
}

/// Format a millisecond timeframe back into the largest unit that divides it
/// evenly. Inverse of [`parse_timeframe`] for all documented units.
pub fn format_timeframe(timeframe_ms: i64) -> String {
    for (unit_ms, suffix) in [
        (MS_MONTH, "M"),
        (MS_WEEK, "w"),
        (MS_DAY, "d"),
        (MS_HOUR, "h"),
        (MS_MINUTE, "m"),
        (MS_SECOND, "s"),
    ] {
        if timeframe_ms >= unit_ms && timeframe_ms % unit_ms == 0 {
            return format!("{}{}", timeframe_ms / unit_ms, suffix);
        }
    }
    format!("{timeframe_ms}ms")
}

/// UTC timestamp in ms -> "YYYY-MM-DD HH:MM:SS" string.
pub fn timestamp_to_datetime(timestamp_ms: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("<invalid ts {timestamp_ms}>"),
    }
}

/// UTC datetime string in the given chrono format -> timestamp in ms.
pub fn datetime_to_timestamp(datetime: &str, format: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(datetime, format).map_err(|e| {
        EngineError::invalid(format!(
            "datetime [{datetime}] does not match format [{format}]: {e}"
        ))
    })?;
    Ok(naive.and_utc().timestamp_millis())
}

/// First instant (ms) of the UTC calendar month after the one containing
/// `timestamp_ms`. Real calendar months; used only for progress logging.
pub fn next_month_boundary(timestamp_ms: i64) -> i64 {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());

    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };

    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|b| b.timestamp_millis())
        .unwrap_or(i64::MAX)
}

/// Format a millisecond difference as a human-readable duration for the
/// run-complete log line.
pub fn format_time_diff(diff_ms: i64) -> String {
    let secs = diff_ms / MS_SECOND;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}.{:03}s", diff_ms % MS_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_every_documented_unit() {
        assert_eq!(parse_timeframe("500ms").unwrap(), 500);
        assert_eq!(parse_timeframe("30s").unwrap(), 30 * MS_SECOND);
        assert_eq!(parse_timeframe("15m").unwrap(), 15 * MS_MINUTE);
        assert_eq!(parse_timeframe("4h").unwrap(), 4 * MS_HOUR);
        assert_eq!(parse_timeframe("1d").unwrap(), MS_DAY);
        assert_eq!(parse_timeframe("1w").unwrap(), MS_WEEK);
        assert_eq!(parse_timeframe("1M").unwrap(), 30 * MS_DAY);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timeframe("").is_err());
        assert!(parse_timeframe("m").is_err());
        assert!(parse_timeframe("15x").is_err());
        assert!(parse_timeframe("0m").is_err());
        assert!(parse_timeframe("-1h").is_err());
    }

    #[test]
    fn datetime_round_trip() {
        let ts = datetime_to_timestamp("2024-03-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(timestamp_to_datetime(ts), "2024-03-01 00:00:00");
    }

    #[test]
    fn month_boundary_uses_calendar_months() {
        // 2024-01-15 -> 2024-02-01, across a 31-day January (not 30 days).
        let jan15 = datetime_to_timestamp("2024-01-15 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let feb1 = datetime_to_timestamp("2024-02-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(next_month_boundary(jan15), feb1);

        // December wraps the year.
        let dec = datetime_to_timestamp("2023-12-31 23:59:59", "%Y-%m-%d %H:%M:%S").unwrap();
        let jan1 = datetime_to_timestamp("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(next_month_boundary(dec), jan1);
    }

    proptest! {
        #[test]
        fn format_parse_round_trip(value in 1i64..1000, unit_idx in 0usize..7) {
            let unit = ["ms", "s", "m", "h", "d", "w", "M"][unit_idx];
            let s = format!("{value}{unit}");
            let ms = parse_timeframe(&s).unwrap();
            // format picks the largest evenly-dividing unit, so re-parsing
            // its output must land on the same millisecond count.
            prop_assert_eq!(parse_timeframe(&format_timeframe(ms)).unwrap(), ms);
        }
    }
}
