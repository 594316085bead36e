//! Pure decisions taken while a job is leased and reported on.
//!
//! Storage backends call these inside their atomic section, with the job row
//! locked, so every backend shares one rule set.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::history::StatusHistoryEntry;
use crate::job::{Actor, Job, JobPatch};
use crate::retry::RetryPolicy;
use crate::status::JobStatus;

pub const REASON_LEASED: &str = "leased by worker";
pub const REASON_SCHEDULE_DUE: &str = "scheduled time reached";
pub const REASON_LEASE_EXHAUSTED: &str = "lease expired; retries exhausted";
pub const REASON_DELIVERED: &str = "delivered";
pub const REASON_DELIVERY_FAILED: &str = "delivery failed";
pub const REASON_RETRIES_EXHAUSTED: &str = "delivery failed; retries exhausted";
pub const ERROR_LEASE_EXPIRED: &str = "LEASE_EXPIRED";

/// `at + delta`, pinned to the representable range instead of overflowing.
pub fn offset_saturating(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(if delta < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Successful delivery as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_code: String,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl DeliveryReceipt {
    pub fn new(provider_code: impl Into<String>) -> Self {
        Self {
            provider_code: provider_code.into(),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Failed delivery as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// What leasing a queue entry does to its job.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseStep {
    /// Hand the job to the worker; the job is now `processing`.
    Deliver(Vec<StatusHistoryEntry>),
    /// The job was already `processing` under an expired lease. It counts as
    /// a lost attempt and is handed out again.
    Redeliver,
    /// The lost attempt used up the retry budget; the job is dead-lettered
    /// and the entry must move to the DLQ.
    Exhausted(StatusHistoryEntry),
    /// The job is in a state no queue entry should reference.
    Orphan,
}

/// Decide and apply the effect of leasing an entry pointing at `job`.
pub fn begin_delivery(
    job: &mut Job,
    worker: &Actor,
    now: DateTime<Utc>,
) -> PipelineResult<LeaseStep> {
    match job.current_status {
        JobStatus::Queued => {
            let entry = job.transition(
                JobStatus::Processing,
                worker,
                Some(REASON_LEASED.to_string()),
                JobPatch::default(),
                now,
            )?;
            Ok(LeaseStep::Deliver(vec![entry]))
        }
        JobStatus::Scheduled => {
            let woken = job.transition(
                JobStatus::Queued,
                &Actor::system(),
                Some(REASON_SCHEDULE_DUE.to_string()),
                JobPatch::default(),
                now,
            )?;
            let leased = job.transition(
                JobStatus::Processing,
                worker,
                Some(REASON_LEASED.to_string()),
                JobPatch::default(),
                now,
            )?;
            Ok(LeaseStep::Deliver(vec![woken, leased]))
        }
        JobStatus::Processing => {
            let retry_count = job.retry_count.saturating_add(1).min(job.max_retries);
            if retry_count >= job.max_retries {
                let entry = job.transition(
                    JobStatus::DeadLetter,
                    &Actor::system(),
                    Some(REASON_LEASE_EXHAUSTED.to_string()),
                    JobPatch {
                        retry_count: Some(retry_count),
                        ..JobPatch::error(
                            Some(ERROR_LEASE_EXPIRED.to_string()),
                            REASON_LEASE_EXHAUSTED,
                        )
                    },
                    now,
                )?;
                Ok(LeaseStep::Exhausted(entry))
            } else {
                job.retry_count = retry_count;
                job.executed_at = Some(now);
                job.updated_at = now;
                job.performed_by = worker.clone();
                Ok(LeaseStep::Redeliver)
            }
        }
        _ => Ok(LeaseStep::Orphan),
    }
}

/// Record a failed attempt on a `processing` job.
///
/// `retry_count` becomes `min(retry_count + 1, max_retries)`. Reaching the
/// limit dead-letters the job in the same step; otherwise it becomes
/// `failed` with `next_retry_at` set from `policy`.
pub fn record_failure(
    job: &mut Job,
    failure: &DeliveryFailure,
    policy: &RetryPolicy,
    actor: &Actor,
    now: DateTime<Utc>,
) -> PipelineResult<StatusHistoryEntry> {
    let retry_count = job.retry_count.saturating_add(1).min(job.max_retries);
    let mut patch = JobPatch::error(failure.code.clone(), failure.message.clone());
    patch.retry_count = Some(retry_count);

    if retry_count >= job.max_retries {
        job.transition(
            JobStatus::DeadLetter,
            actor,
            Some(REASON_RETRIES_EXHAUSTED.to_string()),
            patch,
            now,
        )
    } else {
        patch.next_retry_at = Some(offset_saturating(now, policy.chrono_delay(retry_count)));
        job.transition(
            JobStatus::Failed,
            actor,
            Some(REASON_DELIVERY_FAILED.to_string()),
            patch,
            now,
        )
    }
}

/// Record a successful delivery on a `processing` job.
pub fn record_success(
    job: &mut Job,
    receipt: &DeliveryReceipt,
    actor: &Actor,
    now: DateTime<Utc>,
) -> PipelineResult<StatusHistoryEntry> {
    job.transition(
        JobStatus::Sent,
        actor,
        Some(REASON_DELIVERED.to_string()),
        JobPatch::delivered_by(receipt.provider_code.clone(), receipt.cost),
        now,
    )
}
