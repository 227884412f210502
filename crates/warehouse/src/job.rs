use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Actor, Aggregate, AggregateId, AggregateRoot, DomainError, SiteId, Sku};
use stockroom_events::{Command, Event};
use stockroom_inventory::ProductId;

/// Warehouse job identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub AggregateId);

impl JobId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The five physical task types worked on the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Putaway,
    Pick,
    Pack,
    Dispatch,
    Transfer,
}

impl JobType {
    /// Human-readable job-number prefix, e.g. `PUT-0001`.
    pub fn prefix(self) -> &'static str {
        match self {
            JobType::Putaway => "PUT",
            JobType::Pick => "PICK",
            JobType::Pack => "PACK",
            JobType::Dispatch => "DSP",
            JobType::Transfer => "TRF",
        }
    }
}

/// Job status lifecycle. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// What upstream document a job was spawned for.
///
/// Transfers carry no order reference; they are initiated directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OrderRef {
    PurchaseOrder(AggregateId),
    Sale(AggregateId),
}

/// Per-line fulfillment status within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    Pending,
    Fulfilled,
    /// Closed below the expected quantity under an explicit short-close.
    Short,
}

/// Line item as specified at job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLineSpec {
    pub product_id: ProductId,
    pub sku: Sku,
    pub product_name: String,
    pub expected_qty: i64,
}

/// Line item with live fulfillment progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub sku: Sku,
    pub product_name: String,
    pub expected_qty: i64,
    pub fulfilled_qty: i64,
    pub status: LineStatus,
}

impl JobLine {
    pub fn is_fully_fulfilled(&self) -> bool {
        self.fulfilled_qty >= self.expected_qty
    }
}

/// Aggregate root: WmsJob.
///
/// A job records work against its own lines and only reports the outcome;
/// the ledger effect of completion belongs to the orchestrator, so a reset
/// or cancel here never touches stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WmsJob {
    id: JobId,
    site_id: Option<SiteId>,
    job_number: String,
    job_type: JobType,
    status: JobStatus,
    priority: JobPriority,
    order_ref: Option<OrderRef>,
    assigned_to: Option<Actor>,
    lines: Vec<JobLine>,
    source_site_id: Option<SiteId>,
    dest_site_id: Option<SiteId>,
    short_close_reason: Option<String>,
    version: u64,
    created: bool,
}

impl WmsJob {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: JobId) -> Self {
        Self {
            id,
            site_id: None,
            job_number: String::new(),
            job_type: JobType::Putaway,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            order_ref: None,
            assigned_to: None,
            lines: Vec::new(),
            source_site_id: None,
            dest_site_id: None,
            short_close_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> JobId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn job_number(&self) -> &str {
        &self.job_number
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn order_ref(&self) -> Option<OrderRef> {
        self.order_ref
    }

    pub fn assigned_to(&self) -> Option<&Actor> {
        self.assigned_to.as_ref()
    }

    pub fn lines(&self) -> &[JobLine] {
        &self.lines
    }

    pub fn source_site_id(&self) -> Option<SiteId> {
        self.source_site_id
    }

    pub fn dest_site_id(&self) -> Option<SiteId> {
        self.dest_site_id
    }

    pub fn short_close_reason(&self) -> Option<&str> {
        self.short_close_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Lines that have not reached their expected quantity.
    pub fn open_lines(&self) -> impl Iterator<Item = &JobLine> {
        self.lines.iter().filter(|l| !l.is_fully_fulfilled())
    }
}

impl AggregateRoot for WmsJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateJob.
///
/// Transfers must name distinct `source_site_id`/`dest_site_id`; all other
/// job types work within `site_id` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJob {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub job_number: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub order_ref: Option<OrderRef>,
    pub lines: Vec<JobLineSpec>,
    pub source_site_id: Option<SiteId>,
    pub dest_site_id: Option<SiteId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Assign — hand the job to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assign {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub assignee: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Start working the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordFulfillment — set a line's fulfilled quantity.
///
/// Absolute, not cumulative: scanners re-submit the running total, so a
/// retried scan lands on the same value instead of double-counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFulfillment {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub line_no: u32,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Complete.
///
/// Rejected while any line is under its expected quantity unless a
/// `short_close_reason` is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub short_close_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Reset — return a stuck job to Pending.
///
/// Clears the assignee and zeroes fulfilled quantities. Resetting has no
/// ledger effect; nothing was posted until completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reset {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RelinkLine — repair a line pointing at a missing catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinkLine {
    pub site_id: SiteId,
    pub job_id: JobId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub sku: Sku,
    pub product_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WmsJobCommand {
    CreateJob(CreateJob),
    Assign(Assign),
    Start(Start),
    RecordFulfillment(RecordFulfillment),
    Complete(Complete),
    Cancel(Cancel),
    Reset(Reset),
    RelinkLine(RelinkLine),
}

impl Command for WmsJobCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            WmsJobCommand::CreateJob(c) => c.job_id.0,
            WmsJobCommand::Assign(c) => c.job_id.0,
            WmsJobCommand::Start(c) => c.job_id.0,
            WmsJobCommand::RecordFulfillment(c) => c.job_id.0,
            WmsJobCommand::Complete(c) => c.job_id.0,
            WmsJobCommand::Cancel(c) => c.job_id.0,
            WmsJobCommand::Reset(c) => c.job_id.0,
            WmsJobCommand::RelinkLine(c) => c.job_id.0,
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WmsJobEvent {
    Created {
        site_id: SiteId,
        job_id: JobId,
        job_number: String,
        job_type: JobType,
        priority: JobPriority,
        order_ref: Option<OrderRef>,
        lines: Vec<JobLineSpec>,
        source_site_id: Option<SiteId>,
        dest_site_id: Option<SiteId>,
        occurred_at: DateTime<Utc>,
    },
    Assigned {
        site_id: SiteId,
        job_id: JobId,
        assignee: Actor,
        occurred_at: DateTime<Utc>,
    },
    Started {
        site_id: SiteId,
        job_id: JobId,
        occurred_at: DateTime<Utc>,
    },
    LineFulfilled {
        site_id: SiteId,
        job_id: JobId,
        line_no: u32,
        quantity: i64,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        site_id: SiteId,
        job_id: JobId,
        short_close_reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        site_id: SiteId,
        job_id: JobId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Reset {
        site_id: SiteId,
        job_id: JobId,
        occurred_at: DateTime<Utc>,
    },
    LineRelinked {
        site_id: SiteId,
        job_id: JobId,
        line_no: u32,
        product_id: ProductId,
        sku: Sku,
        product_name: String,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for WmsJobEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WmsJobEvent::Created { .. } => "warehouse.job.created",
            WmsJobEvent::Assigned { .. } => "warehouse.job.assigned",
            WmsJobEvent::Started { .. } => "warehouse.job.started",
            WmsJobEvent::LineFulfilled { .. } => "warehouse.job.line_fulfilled",
            WmsJobEvent::Completed { .. } => "warehouse.job.completed",
            WmsJobEvent::Cancelled { .. } => "warehouse.job.cancelled",
            WmsJobEvent::Reset { .. } => "warehouse.job.reset",
            WmsJobEvent::LineRelinked { .. } => "warehouse.job.line_relinked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WmsJobEvent::Created { occurred_at, .. }
            | WmsJobEvent::Assigned { occurred_at, .. }
            | WmsJobEvent::Started { occurred_at, .. }
            | WmsJobEvent::LineFulfilled { occurred_at, .. }
            | WmsJobEvent::Completed { occurred_at, .. }
            | WmsJobEvent::Cancelled { occurred_at, .. }
            | WmsJobEvent::Reset { occurred_at, .. }
            | WmsJobEvent::LineRelinked { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for WmsJob {
    type Command = WmsJobCommand;
    type Event = WmsJobEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WmsJobEvent::Created {
                site_id,
                job_id,
                job_number,
                job_type,
                priority,
                order_ref,
                lines,
                source_site_id,
                dest_site_id,
                ..
            } => {
                self.id = *job_id;
                self.site_id = Some(*site_id);
                self.job_number = job_number.clone();
                self.job_type = *job_type;
                self.status = JobStatus::Pending;
                self.priority = *priority;
                self.order_ref = *order_ref;
                self.assigned_to = None;
                self.lines = lines
                    .iter()
                    .enumerate()
                    .map(|(i, spec)| JobLine {
                        line_no: (i as u32) + 1,
                        product_id: spec.product_id,
                        sku: spec.sku.clone(),
                        product_name: spec.product_name.clone(),
                        expected_qty: spec.expected_qty,
                        fulfilled_qty: 0,
                        status: LineStatus::Pending,
                    })
                    .collect();
                self.source_site_id = *source_site_id;
                self.dest_site_id = *dest_site_id;
                self.short_close_reason = None;
                self.created = true;
            }
            WmsJobEvent::Assigned { assignee, .. } => {
                self.assigned_to = Some(assignee.clone());
                if self.status == JobStatus::Pending {
                    self.status = JobStatus::Assigned;
                }
            }
            WmsJobEvent::Started { .. } => {
                self.status = JobStatus::InProgress;
            }
            WmsJobEvent::LineFulfilled {
                line_no, quantity, ..
            } => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == *line_no) {
                    line.fulfilled_qty = *quantity;
                    line.status = if line.is_fully_fulfilled() {
                        LineStatus::Fulfilled
                    } else {
                        LineStatus::Pending
                    };
                }
            }
            WmsJobEvent::Completed {
                short_close_reason, ..
            } => {
                self.status = JobStatus::Completed;
                self.short_close_reason = short_close_reason.clone();
                if short_close_reason.is_some() {
                    for line in self.lines.iter_mut() {
                        if !line.is_fully_fulfilled() {
                            line.status = LineStatus::Short;
                        }
                    }
                }
            }
            WmsJobEvent::Cancelled { .. } => {
                self.status = JobStatus::Cancelled;
            }
            WmsJobEvent::Reset { .. } => {
                self.status = JobStatus::Pending;
                self.assigned_to = None;
                self.short_close_reason = None;
                for line in self.lines.iter_mut() {
                    line.fulfilled_qty = 0;
                    line.status = LineStatus::Pending;
                }
            }
            WmsJobEvent::LineRelinked {
                line_no,
                product_id,
                sku,
                product_name,
                ..
            } => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == *line_no) {
                    line.product_id = *product_id;
                    line.sku = sku.clone();
                    line.product_name = product_name.clone();
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WmsJobCommand::CreateJob(cmd) => self.handle_create(cmd),
            WmsJobCommand::Assign(cmd) => self.handle_assign(cmd),
            WmsJobCommand::Start(cmd) => self.handle_start(cmd),
            WmsJobCommand::RecordFulfillment(cmd) => self.handle_record(cmd),
            WmsJobCommand::Complete(cmd) => self.handle_complete(cmd),
            WmsJobCommand::Cancel(cmd) => self.handle_cancel(cmd),
            WmsJobCommand::Reset(cmd) => self.handle_reset(cmd),
            WmsJobCommand::RelinkLine(cmd) => self.handle_relink(cmd),
        }
    }
}

impl WmsJob {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::state_conflict("site mismatch"));
        }
        Ok(())
    }

    fn ensure_job_id(&self, job_id: JobId) -> Result<(), DomainError> {
        if self.id != job_id {
            return Err(DomainError::state_conflict("job_id mismatch"));
        }
        Ok(())
    }

    fn ensure_workable(&self) -> Result<(), DomainError> {
        match self.status {
            JobStatus::Completed => Err(DomainError::state_conflict("job is already completed")),
            JobStatus::Cancelled => Err(DomainError::state_conflict("job is cancelled")),
            _ => Ok(()),
        }
    }

    fn handle_create(&self, cmd: &CreateJob) -> Result<Vec<WmsJobEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("job already exists"));
        }
        if cmd.job_number.trim().is_empty() {
            return Err(DomainError::validation("job_number cannot be empty"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("a job needs at least one line item"));
        }
        if let Some(bad) = cmd.lines.iter().find(|l| l.expected_qty <= 0) {
            return Err(DomainError::validation(format!(
                "expected quantity for {} must be positive",
                bad.sku
            )));
        }

        match cmd.job_type {
            JobType::Transfer => {
                let (source, dest) = match (cmd.source_site_id, cmd.dest_site_id) {
                    (Some(s), Some(d)) => (s, d),
                    _ => {
                        return Err(DomainError::validation(
                            "transfer jobs need both source and destination sites",
                        ));
                    }
                };
                if source == dest {
                    return Err(DomainError::validation(
                        "transfer source and destination must differ",
                    ));
                }
                if cmd.site_id != source {
                    return Err(DomainError::validation(
                        "transfer jobs are owned by their source site",
                    ));
                }
            }
            _ => {
                if cmd.source_site_id.is_some() || cmd.dest_site_id.is_some() {
                    return Err(DomainError::validation(
                        "only transfer jobs carry source/destination sites",
                    ));
                }
            }
        }

        Ok(vec![WmsJobEvent::Created {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            job_number: cmd.job_number.clone(),
            job_type: cmd.job_type,
            priority: cmd.priority,
            order_ref: cmd.order_ref,
            lines: cmd.lines.clone(),
            source_site_id: cmd.source_site_id,
            dest_site_id: cmd.dest_site_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_assign(&self, cmd: &Assign) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;
        self.ensure_workable()?;

        if self.assigned_to.as_ref() == Some(&cmd.assignee) {
            // Idempotent retry.
            return Ok(vec![]);
        }

        Ok(vec![WmsJobEvent::Assigned {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            assignee: cmd.assignee.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_start(&self, cmd: &Start) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;
        self.ensure_workable()?;

        if self.status == JobStatus::InProgress {
            return Ok(vec![]);
        }

        Ok(vec![WmsJobEvent::Started {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_record(&self, cmd: &RecordFulfillment) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;
        self.ensure_workable()?;

        let line = self
            .lines
            .iter()
            .find(|l| l.line_no == cmd.line_no)
            .ok_or_else(|| {
                DomainError::unresolved(format!("no line {} on this job", cmd.line_no))
            })?;

        if cmd.quantity < 0 {
            return Err(DomainError::validation("fulfilled quantity cannot be negative"));
        }
        if cmd.quantity > line.expected_qty {
            return Err(DomainError::validation(format!(
                "fulfilled quantity {} exceeds expected {} on line {}",
                cmd.quantity, line.expected_qty, line.line_no
            )));
        }
        if cmd.quantity == line.fulfilled_qty {
            return Ok(vec![]);
        }

        Ok(vec![WmsJobEvent::LineFulfilled {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            line_no: cmd.line_no,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_complete(&self, cmd: &Complete) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;

        match self.status {
            JobStatus::Completed => {
                return Err(DomainError::state_conflict("job is already completed"));
            }
            JobStatus::Cancelled => {
                return Err(DomainError::state_conflict("cannot complete a cancelled job"));
            }
            _ => {}
        }

        if cmd.short_close_reason.is_none() {
            if let Some(line) = self.open_lines().next() {
                return Err(DomainError::validation(format!(
                    "line {} ({}) fulfilled {}/{}; give a short-close reason to close anyway",
                    line.line_no, line.sku, line.fulfilled_qty, line.expected_qty
                )));
            }
        } else if cmd
            .short_close_reason
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            return Err(DomainError::validation("short-close reason cannot be blank"));
        }

        Ok(vec![WmsJobEvent::Completed {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            short_close_reason: cmd.short_close_reason.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;

        match self.status {
            JobStatus::Cancelled => Ok(vec![]),
            JobStatus::Completed => Err(DomainError::state_conflict(
                "cannot cancel a completed job; its ledger entries are already posted",
            )),
            _ => Ok(vec![WmsJobEvent::Cancelled {
                site_id: cmd.site_id,
                job_id: cmd.job_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            }]),
        }
    }

    fn handle_reset(&self, cmd: &Reset) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;
        self.ensure_workable()?;

        Ok(vec![WmsJobEvent::Reset {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_relink(&self, cmd: &RelinkLine) -> Result<Vec<WmsJobEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_job_id(cmd.job_id)?;
        self.ensure_workable()?;

        let line = self
            .lines
            .iter()
            .find(|l| l.line_no == cmd.line_no)
            .ok_or_else(|| {
                DomainError::unresolved(format!("no line {} on this job", cmd.line_no))
            })?;

        if line.product_id == cmd.product_id {
            return Ok(vec![]);
        }

        Ok(vec![WmsJobEvent::LineRelinked {
            site_id: cmd.site_id,
            job_id: cmd.job_id,
            line_no: cmd.line_no,
            product_id: cmd.product_id,
            sku: cmd.sku.clone(),
            product_name: cmd.product_name.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_events::execute;

    fn test_site_id() -> SiteId {
        SiteId::new()
    }

    fn test_job_id() -> JobId {
        JobId::new(AggregateId::new())
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_actor() -> Actor {
        Actor::new("picker.one").unwrap()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn line_spec(sku: &str, expected: i64) -> JobLineSpec {
        JobLineSpec {
            product_id: test_product_id(),
            sku: Sku::new(sku).unwrap(),
            product_name: format!("Product {sku}"),
            expected_qty: expected,
        }
    }

    fn pending_job(site_id: SiteId, job_id: JobId, lines: Vec<JobLineSpec>) -> WmsJob {
        let mut job = WmsJob::empty(job_id);
        execute(
            &mut job,
            &WmsJobCommand::CreateJob(CreateJob {
                site_id,
                job_id,
                job_number: "PICK-0001".to_string(),
                job_type: JobType::Pick,
                priority: JobPriority::Normal,
                order_ref: Some(OrderRef::Sale(AggregateId::new())),
                lines,
                source_site_id: None,
                dest_site_id: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        job
    }

    fn record(job: &mut WmsJob, line_no: u32, quantity: i64) {
        let site_id = job.site_id().unwrap();
        let job_id = job.id_typed();
        execute(
            job,
            &WmsJobCommand::RecordFulfillment(RecordFulfillment {
                site_id,
                job_id,
                line_no,
                quantity,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
    }

    #[test]
    fn create_rejects_empty_lines() {
        let job = WmsJob::empty(test_job_id());
        let err = job
            .handle(&WmsJobCommand::CreateJob(CreateJob {
                site_id: test_site_id(),
                job_id: job.id_typed(),
                job_number: "PICK-0001".to_string(),
                job_type: JobType::Pick,
                priority: JobPriority::Normal,
                order_ref: None,
                lines: vec![],
                source_site_id: None,
                dest_site_id: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn transfer_requires_distinct_source_and_destination() {
        let site = test_site_id();
        let job = WmsJob::empty(test_job_id());
        let err = job
            .handle(&WmsJobCommand::CreateJob(CreateJob {
                site_id: site,
                job_id: job.id_typed(),
                job_number: "TRF-0001".to_string(),
                job_type: JobType::Transfer,
                priority: JobPriority::High,
                order_ref: None,
                lines: vec![line_spec("SKU-1", 5)],
                source_site_id: Some(site),
                dest_site_id: Some(site),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn assignment_moves_pending_to_assigned() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 10)]);
        let assign = WmsJobCommand::Assign(Assign {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            assignee: test_actor(),
            occurred_at: test_time(),
        });
        execute(&mut job, &assign).unwrap();
        assert_eq!(job.status(), JobStatus::Assigned);
        assert_eq!(job.assigned_to(), Some(&test_actor()));
    }

    #[test]
    fn reassigning_the_same_worker_is_a_noop() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 10)]);
        let assign = WmsJobCommand::Assign(Assign {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            assignee: test_actor(),
            occurred_at: test_time(),
        });
        execute(&mut job, &assign).unwrap();
        let retry = execute(&mut job, &assign).unwrap();
        assert!(retry.is_empty());
    }

    #[test]
    fn recording_beyond_expected_is_rejected() {
        let job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 10)]);
        let err = job
            .handle(&WmsJobCommand::RecordFulfillment(RecordFulfillment {
                site_id: job.site_id().unwrap(),
                job_id: job.id_typed(),
                line_no: 1,
                quantity: 11,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn completion_is_blocked_while_lines_are_open() {
        let mut job = pending_job(
            test_site_id(),
            test_job_id(),
            vec![line_spec("SKU-1", 10), line_spec("SKU-2", 4)],
        );
        record(&mut job, 1, 10);
        record(&mut job, 2, 3);

        let err = job
            .handle(&WmsJobCommand::Complete(Complete {
                site_id: job.site_id().unwrap(),
                job_id: job.id_typed(),
                short_close_reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn short_close_completes_and_marks_open_lines() {
        let mut job = pending_job(
            test_site_id(),
            test_job_id(),
            vec![line_spec("SKU-1", 10), line_spec("SKU-2", 4)],
        );
        record(&mut job, 1, 10);
        record(&mut job, 2, 3);

        let complete = WmsJobCommand::Complete(Complete {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            short_close_reason: Some("stock damaged in bin".to_string()),
            occurred_at: test_time(),
        });
        execute(&mut job, &complete).unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.short_close_reason(), Some("stock damaged in bin"));
        assert_eq!(job.lines()[0].status, LineStatus::Fulfilled);
        assert_eq!(job.lines()[1].status, LineStatus::Short);
    }

    #[test]
    fn completing_twice_is_a_state_conflict() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 2)]);
        record(&mut job, 1, 2);
        let complete = WmsJobCommand::Complete(Complete {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            short_close_reason: None,
            occurred_at: test_time(),
        });
        execute(&mut job, &complete).unwrap();

        let err = job.handle(&complete).unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));
    }

    #[test]
    fn cancel_after_completion_is_rejected() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 2)]);
        record(&mut job, 1, 2);
        let complete = WmsJobCommand::Complete(Complete {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            short_close_reason: None,
            occurred_at: test_time(),
        });
        execute(&mut job, &complete).unwrap();

        let err = job
            .handle(&WmsJobCommand::Cancel(Cancel {
                site_id: job.site_id().unwrap(),
                job_id: job.id_typed(),
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));
    }

    #[test]
    fn reset_returns_job_to_pending_and_zeroes_progress() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 10)]);
        let assign = WmsJobCommand::Assign(Assign {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            assignee: test_actor(),
            occurred_at: test_time(),
        });
        execute(&mut job, &assign).unwrap();
        let start = WmsJobCommand::Start(Start {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            occurred_at: test_time(),
        });
        execute(&mut job, &start).unwrap();
        record(&mut job, 1, 7);

        let reset = WmsJobCommand::Reset(Reset {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            occurred_at: test_time(),
        });
        execute(&mut job, &reset).unwrap();

        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.assigned_to().is_none());
        assert_eq!(job.lines()[0].fulfilled_qty, 0);
        assert_eq!(job.lines()[0].status, LineStatus::Pending);
    }

    #[test]
    fn relink_repairs_a_line_product_reference() {
        let mut job = pending_job(test_site_id(), test_job_id(), vec![line_spec("SKU-1", 5)]);
        let new_product = test_product_id();
        let relink = WmsJobCommand::RelinkLine(RelinkLine {
            site_id: job.site_id().unwrap(),
            job_id: job.id_typed(),
            line_no: 1,
            product_id: new_product,
            sku: Sku::new("SKU-1R").unwrap(),
            product_name: "Replacement".to_string(),
            occurred_at: test_time(),
        });
        execute(&mut job, &relink).unwrap();
        assert_eq!(job.lines()[0].product_id, new_product);
        assert_eq!(job.lines()[0].sku.as_str(), "SKU-1R");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Fulfilled quantities track the last accepted absolute value and
            // never leave [0, expected], no matter how scans arrive.
            #[test]
            fn fulfilled_stays_within_bounds(
                expected in 1i64..500,
                scans in proptest::collection::vec(-50i64..600, 1..32),
            ) {
                let site_id = test_site_id();
                let mut job = pending_job(site_id, test_job_id(), vec![line_spec("SKU-P", expected)]);
                let job_id = job.id_typed();

                let mut last_accepted = 0i64;
                for scan in scans {
                    let result = execute(
                        &mut job,
                        &WmsJobCommand::RecordFulfillment(RecordFulfillment {
                            site_id,
                            job_id,
                            line_no: 1,
                            quantity: scan,
                            occurred_at: test_time(),
                        }),
                    );
                    if (0..=expected).contains(&scan) {
                        let events = result.unwrap();
                        // Re-submitting the running total is a no-op.
                        if scan == last_accepted {
                            prop_assert!(events.is_empty());
                        }
                        last_accepted = scan;
                    } else {
                        prop_assert!(result.is_err());
                    }
                    let fulfilled = job.lines()[0].fulfilled_qty;
                    prop_assert!((0..=expected).contains(&fulfilled));
                    prop_assert_eq!(fulfilled, last_accepted);
                }
            }
        }
    }
}
