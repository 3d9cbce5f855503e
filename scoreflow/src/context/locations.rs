//! Storage location derivation.
//!
//! All run-scoped locations are pure functions of their inputs so that a
//! retried stage lands on exactly the same prefix as the first attempt.

use crate::errors::ScoreflowError;
use crate::utils::validate_run_id;
use chrono::NaiveDate;
use std::fmt;

/// Object name stem used for exported snapshot parts.
pub const SNAPSHOT_OBJECT_STEM: &str = "batch_";

/// Derives the location compute results must be written under.
///
/// Formatted as `{namespace}/run_id={run_id}/`; trailing slashes on the
/// namespace are ignored.
///
/// # Examples
///
/// ```
/// use scoreflow::context::output_location;
///
/// let loc = output_location("/scored", "R1").unwrap();
/// assert_eq!(loc, "/scored/run_id=R1/");
/// ```
pub fn output_location(namespace: &str, run_id: &str) -> Result<String, ScoreflowError> {
    validate_run_id(run_id)?;
    Ok(format!("{}/run_id={run_id}/", namespace.trim_end_matches('/')))
}

/// Joins a bucket and a key namespace into a `s3://` prefix without a
/// trailing slash.
#[must_use]
pub fn bucket_namespace(bucket: &str, namespace: &str) -> String {
    format!(
        "s3://{}/{}",
        bucket.trim_end_matches('/'),
        namespace.trim_matches('/')
    )
}

/// Derives the run-scoped prefix an export snapshot is written under.
pub fn snapshot_prefix(
    bucket: &str,
    raw_namespace: &str,
    run_date: NaiveDate,
    run_id: &str,
) -> Result<String, ScoreflowError> {
    validate_run_id(run_id)?;
    Ok(format!(
        "{}/run_date={run_date}/run_id={run_id}/",
        bucket_namespace(bucket, raw_namespace)
    ))
}

/// Returns true if an object key looks like a data file.
#[must_use]
pub fn is_data_object(key: &str, extensions: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
}

/// A parsed `scheme://bucket/key` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// URI scheme, e.g. `s3`.
    pub scheme: String,
    /// Bucket or authority component.
    pub bucket: String,
    /// Key within the bucket; may be empty.
    pub key: String,
}

impl Location {
    /// Parses a location string.
    pub fn parse(input: &str) -> Result<Self, ScoreflowError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| ScoreflowError::InvalidLocation(input.to_string()))?;
        if scheme.is_empty() {
            return Err(ScoreflowError::InvalidLocation(input.to_string()));
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ScoreflowError::InvalidLocation(input.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_output_location_format() {
        assert_eq!(output_location("/scored", "R1").unwrap(), "/scored/run_id=R1/");
        assert_eq!(output_location("/scored/", "R1").unwrap(), "/scored/run_id=R1/");
        assert_eq!(
            output_location("s3://data/trust_scoring/scored", "abc").unwrap(),
            "s3://data/trust_scoring/scored/run_id=abc/"
        );
    }

    #[test]
    fn test_output_location_is_stable() {
        let first = output_location("/scored", "R1").unwrap();
        let second = output_location("/scored", "R1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_output_location_rejects_escaping_run_id() {
        assert!(output_location("/scored", "../R1").is_err());
        assert!(output_location("/scored", "R1/../../x").is_err());
        assert!(output_location("/scored", "..").is_err());
    }

    #[test]
    fn test_snapshot_prefix() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let prefix = snapshot_prefix("data-bucket", "trust_scoring/raw", date, "R1").unwrap();
        assert_eq!(
            prefix,
            "s3://data-bucket/trust_scoring/raw/run_date=2024-06-01/run_id=R1/"
        );
    }

    #[test]
    fn test_bucket_namespace_normalises_slashes() {
        assert_eq!(
            bucket_namespace("bucket/", "/trust_scoring/scored/"),
            "s3://bucket/trust_scoring/scored"
        );
    }

    #[test]
    fn test_is_data_object() {
        let exts = vec![".parquet".to_string(), ".pq".to_string(), ".csv".to_string()];
        assert!(is_data_object("raw/batch_0000_part_00.parquet", &exts));
        assert!(is_data_object("raw/BATCH.CSV", &exts));
        assert!(!is_data_object("raw/_manifest.json", &exts));
    }

    #[test]
    fn test_location_parse_and_display() {
        let loc = Location::parse("s3://bucket/trust_scoring/raw/x.parquet").unwrap();
        assert_eq!(loc.scheme, "s3");
        assert_eq!(loc.bucket, "bucket");
        assert_eq!(loc.key, "trust_scoring/raw/x.parquet");
        assert_eq!(loc.to_string(), "s3://bucket/trust_scoring/raw/x.parquet");

        let bare = Location::parse("s3://bucket").unwrap();
        assert_eq!(bare.key, "");
    }

    #[test]
    fn test_location_parse_rejects_invalid() {
        assert!(Location::parse("/raw/R1").is_err());
        assert!(Location::parse("s3:///key").is_err());
        assert!(Location::parse("://bucket/key").is_err());
    }
}
