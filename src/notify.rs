//! Failure notification callback.
//!
//! The relay calls the notifier once per work item when the item reaches
//! `failed`, after the transition is committed. Lease expiry and transient
//! retries are never notified.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::work::WorkId;

/// Why the item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload can never be delivered.
    Permanent,
    /// Transient failures outlasted the retry budget.
    Exhausted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Permanent => "permanent",
            FailureKind::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub work_id: WorkId,
    pub business_key: String,
    pub kind: FailureKind,
    pub retry_count: u32,
    pub reason: String,
}

#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, notice: FailureNotice);
}

/// Emits an `error` event per failure. Used when nothing else is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl FailureNotifier for TracingNotifier {
    async fn notify(&self, notice: FailureNotice) {
        tracing::error!(
            work_id = %notice.work_id,
            business_key = %notice.business_key,
            kind = notice.kind.as_str(),
            retry_count = notice.retry_count,
            reason = %notice.reason,
            "work item failed"
        );
    }
}
