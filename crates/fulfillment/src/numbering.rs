//! Document number allocation.
//!
//! Jobs, purchase orders, and receipts carry human-readable numbers drawn
//! from per-series counters. Allocation lives here rather than in the
//! domain: the aggregates treat their number as an opaque required string.

use std::collections::HashMap;
use std::sync::Mutex;

use stockroom_warehouse::{format_job_number, JobType};

/// Monotonic per-series counters.
///
/// Numbers are allocated before the command is dispatched, so a rejected
/// command can leave a gap in the series. Gaps are fine; collisions are not.
#[derive(Debug, Default)]
pub struct NumberAllocator {
    job_counters: Mutex<HashMap<JobType, u64>>,
    po_counter: Mutex<u64>,
    receipt_counter: Mutex<u64>,
}

impl NumberAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_job_number(&self, job_type: JobType) -> String {
        let mut counters = match self.job_counters.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters.entry(job_type).or_insert(0);
        *counter += 1;
        format_job_number(job_type, *counter)
    }

    pub fn next_po_number(&self) -> String {
        let mut counter = match self.po_counter.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counter += 1;
        format!("PO-{:04}", *counter)
    }

    pub fn next_receipt_number(&self) -> String {
        let mut counter = match self.receipt_counter.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counter += 1;
        format!("RCPT-{:04}", *counter)
    }

    /// Raise the job series for `job_type` to at least the counter embedded
    /// in an already-issued number. Unparseable numbers are skipped: an
    /// imported or hand-entered number outside the series cannot collide
    /// with what we allocate.
    pub fn observe_job_number(&self, job_type: JobType, number: &str) {
        let Some(seen) = trailing_counter(number) else {
            return;
        };
        let mut counters = match self.job_counters.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters.entry(job_type).or_insert(0);
        *counter = (*counter).max(seen);
    }

    pub fn observe_po_number(&self, number: &str) {
        let Some(seen) = trailing_counter(number) else {
            return;
        };
        let mut counter = match self.po_counter.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counter = (*counter).max(seen);
    }

    pub fn observe_receipt_number(&self, number: &str) {
        let Some(seen) = trailing_counter(number) else {
            return;
        };
        let mut counter = match self.receipt_counter.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counter = (*counter).max(seen);
    }
}

fn trailing_counter(number: &str) -> Option<u64> {
    number.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_series_are_independent_per_type() {
        let alloc = NumberAllocator::new();
        assert_eq!(alloc.next_job_number(JobType::Putaway), "PUT-0001");
        assert_eq!(alloc.next_job_number(JobType::Pick), "PICK-0001");
        assert_eq!(alloc.next_job_number(JobType::Putaway), "PUT-0002");
    }

    #[test]
    fn po_and_receipt_series_count_up() {
        let alloc = NumberAllocator::new();
        assert_eq!(alloc.next_po_number(), "PO-0001");
        assert_eq!(alloc.next_po_number(), "PO-0002");
        assert_eq!(alloc.next_receipt_number(), "RCPT-0001");
    }

    #[test]
    fn observed_numbers_advance_the_series() {
        let alloc = NumberAllocator::new();
        alloc.observe_po_number("PO-0007");
        assert_eq!(alloc.next_po_number(), "PO-0008");

        alloc.observe_job_number(JobType::Pick, "PICK-0003");
        assert_eq!(alloc.next_job_number(JobType::Pick), "PICK-0004");
        // Other series are unaffected.
        assert_eq!(alloc.next_job_number(JobType::Putaway), "PUT-0001");
    }

    #[test]
    fn observing_a_lower_number_never_rewinds() {
        let alloc = NumberAllocator::new();
        alloc.observe_receipt_number("RCPT-0009");
        alloc.observe_receipt_number("RCPT-0002");
        assert_eq!(alloc.next_receipt_number(), "RCPT-0010");
    }

    #[test]
    fn unparseable_numbers_are_ignored() {
        let alloc = NumberAllocator::new();
        alloc.observe_po_number("LEGACY/17");
        assert_eq!(alloc.next_po_number(), "PO-0001");
    }
}
