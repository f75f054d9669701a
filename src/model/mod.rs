//! Core data model.
//!
//! A work item is one inbound business event on its way from the ledger to
//! the replica. Its outbox record carries the pending downstream effect,
//! idempotency keys fence that effect, and reconciliation reports audit
//! whether both stores still agree.

pub mod idempotency;
pub mod outbox;
pub mod report;
pub mod work;
