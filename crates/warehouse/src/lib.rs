//! Warehouse job engine.
//!
//! Every physical task on the floor is tracked as a [`WmsJob`]: putting
//! received goods away, picking for a sale, packing, dispatching, and
//! moving stock between sites. Jobs carry their own line items with
//! expected and fulfilled quantities; the inventory ledger is only
//! touched when a job completes, which keeps a half-done pick from
//! leaking into stock levels.

pub mod job;
pub mod job_number;

pub use job::{
    JobId, JobLine, JobLineSpec, JobPriority, JobStatus, JobType, LineStatus, OrderRef,
    WmsJob, WmsJobCommand, WmsJobEvent,
};
pub use job_number::format_job_number;
