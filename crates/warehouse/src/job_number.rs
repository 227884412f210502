//! Human-readable job numbers.
//!
//! Numbers are per-type sequences rendered as `{prefix}-{counter}` with the
//! counter zero-padded to four digits, e.g. `PUT-0001`, `PICK-0042`. Padding
//! widens past 9999 rather than wrapping.

use crate::job::JobType;

pub fn format_job_number(job_type: JobType, counter: u64) -> String {
    format!("{}-{:04}", job_type.prefix(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_zero_padded_to_four_digits() {
        assert_eq!(format_job_number(JobType::Putaway, 1), "PUT-0001");
        assert_eq!(format_job_number(JobType::Pick, 42), "PICK-0042");
        assert_eq!(format_job_number(JobType::Pack, 999), "PACK-0999");
        assert_eq!(format_job_number(JobType::Dispatch, 7), "DSP-0007");
        assert_eq!(format_job_number(JobType::Transfer, 1234), "TRF-1234");
    }

    #[test]
    fn numbers_widen_past_four_digits() {
        assert_eq!(format_job_number(JobType::Pick, 10000), "PICK-10000");
    }
}
