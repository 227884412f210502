use stockroom_core::AggregateId;

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent** - a request to perform an action on an
/// aggregate. They are **transient** (not persisted) and are transformed into
/// events (which are persisted).
///
/// | | |
/// |---|---|
/// | **Command** | "Record 50 units fulfilled on this line" |
/// | **Event** | `LineFulfilled { line_no: 1, quantity: 50 }` |
///
/// Commands are rejected if invalid; events represent accepted changes.
///
/// Each command operates on one aggregate, which is the transaction boundary
/// for single-entity operations. Cross-entity commits (a job completion plus
/// its ledger entries) are grouped at the store level instead.
///
/// Site isolation is enforced at the **event level** (envelopes), not the
/// command level; the site context is attached during persistence.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
