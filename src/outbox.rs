//! Outbox writer.
//!
//! Commits a ledger mutation together with the record of its downstream
//! effect. The writer never talks to the replica: the relay delivers the
//! record later, so ledger commits never wait on replica availability.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;

use crate::clock::Clock;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::model::outbox::{CommitOutcome, CommitRequest, DownstreamEffect, LedgerMutation};
use crate::model::work::{Status, WorkId};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct OutboxWriter {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
}

impl OutboxWriter {
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// Commit `mutation` for a `received` work item.
    ///
    /// With an effect, exactly one outbox record is written in the same
    /// transaction and the item becomes `queued`. Without one, no record is
    /// written and the item becomes `not_applicable`. If the commit fails,
    /// neither the mutation nor the record is visible.
    pub async fn commit(
        &self,
        work_id: WorkId,
        mutation: LedgerMutation,
        effect: Option<DownstreamEffect>,
    ) -> Result<CommitOutcome> {
        let start = Instant::now();
        let request = CommitRequest {
            work_id,
            mutation,
            effect,
        };

        let outcome = match self.ledger.commit_mutation(request, self.clock.now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(work_id = %work_id, error = %e, "ledger commit aborted");
                return Err(e);
            }
        };

        let (label, to) = match &outcome.outbox {
            Some(record) => {
                tracing::info!(
                    work_id = %work_id,
                    outbox_id = %record.id,
                    aggregate = %outcome.aggregate.business_key,
                    version = outcome.aggregate.version,
                    "mutation committed with outbox record"
                );
                ("written", Status::Queued)
            }
            None => {
                tracing::info!(
                    work_id = %work_id,
                    aggregate = %outcome.aggregate.business_key,
                    version = outcome.aggregate.version,
                    "mutation committed without downstream effect"
                );
                ("none", Status::NotApplicable)
            }
        };

        metrics::outbox_committed().add(1, &[KeyValue::new("outbox", label)]);
        metrics::work_state_transitions().add(
            1,
            &[
                KeyValue::new("from", Status::Received.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "outbox_commit")],
        );

        Ok(outcome)
    }
}
