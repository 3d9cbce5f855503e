//! Run identifier generation, validation and deterministic tokens.

use crate::errors::ScoreflowError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use uuid::Uuid;

#[allow(clippy::expect_used)]
static RUN_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("run id pattern compiles"));

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Mints a fresh run identifier.
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Checks that a run id can be embedded as a single location segment.
///
/// Slashes and `.`/`..` would let a run id escape its namespace.
pub fn validate_run_id(run_id: &str) -> Result<(), ScoreflowError> {
    if run_id == "." || run_id == ".." || !RUN_ID_PATTERN.is_match(run_id) {
        return Err(ScoreflowError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}

/// Derives a stable token from its components.
///
/// The same components always yield the same token, so a resubmitted
/// request can be recognised as a duplicate by the receiving service.
#[must_use]
pub fn statement_token(components: &[&str]) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}
