//! Utility functions for identifiers and timestamp handling.

mod ids;
pub mod timestamps;

pub use ids::{generate_run_id, generate_uuid, statement_token, validate_run_id};
pub use timestamps::{date_in, iso_timestamp, now_utc, parse_run_date, today_in, Timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_valid() {
        let id = generate_uuid();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn test_generated_run_id_is_valid() {
        let run_id = generate_run_id();
        assert!(validate_run_id(&run_id).is_ok());
    }
}
