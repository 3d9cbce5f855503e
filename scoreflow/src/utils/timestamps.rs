//! Timestamp and run-date helpers.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use scoreflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the calendar date of `instant` in `zone`.
#[must_use]
pub fn date_in(instant: Timestamp, zone: Tz) -> NaiveDate {
    instant.with_timezone(&zone).date_naive()
}

/// Returns today's date in `zone`.
#[must_use]
pub fn today_in(zone: Tz) -> NaiveDate {
    date_in(Utc::now(), zone)
}

/// Parses a `YYYY-MM-DD` run date.
pub fn parse_run_date(input: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_date() {
        let date = parse_run_date("2024-06-01").unwrap();
        assert_eq!(date.to_string(), "2024-06-01");
    }

    #[test]
    fn test_parse_run_date_trims() {
        assert!(parse_run_date(" 2024-06-01 ").is_ok());
    }

    #[test]
    fn test_parse_run_date_rejects_garbage() {
        assert!(parse_run_date("01/06/2024").is_err());
        assert!(parse_run_date("").is_err());
    }

    #[test]
    fn test_now_and_today_agree() {
        let now = now_utc();
        let today = today_in(chrono_tz::UTC);
        assert!((now.date_naive() - today).num_days().abs() <= 1);
    }

    #[test]
    fn test_london_date_runs_ahead_of_utc_during_bst() {
        let late_evening = "2024-06-01T23:30:00Z".parse::<Timestamp>().unwrap();
        assert_eq!(
            date_in(late_evening, chrono_tz::Europe::London),
            NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()
        );
        assert_eq!(
            date_in(late_evening, chrono_tz::UTC),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
    }

    #[test]
    fn test_london_date_matches_utc_in_winter() {
        let late_evening = "2024-01-15T23:30:00Z".parse::<Timestamp>().unwrap();
        assert_eq!(
            date_in(late_evening, chrono_tz::Europe::London),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }
}
