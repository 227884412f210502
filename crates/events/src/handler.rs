/// Execute an aggregate command deterministically (no IO, no async).
///
/// Decide-then-evolve in one step:
///
/// 1. **Decide**: `aggregate.handle(command)` produces events (pure).
/// 2. **Evolve**: each event is applied to the aggregate in order.
///
/// Mutates the aggregate in place. For the full pipeline (persistence,
/// publication, optimistic concurrency) use the command dispatcher in the
/// fulfillment crate; this helper is for unit tests and inline processing.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: stockroom_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
