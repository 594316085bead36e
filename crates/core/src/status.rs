//! Job status and the legal transition table.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Lifecycle status of a JTD record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Pending,
    Queued,
    Scheduled,
    Processing,
    Sent,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Created,
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Scheduled,
        JobStatus::Processing,
        JobStatus::Sent,
        JobStatus::Failed,
        JobStatus::DeadLetter,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `self -> to` appears in the transition table.
    ///
    /// Self-transitions are not legal; idempotent duplicates are handled by
    /// the callers that tolerate them.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Created, Pending)
                | (Pending, Queued)
                | (Queued, Scheduled)
                | (Scheduled, Queued)
                | (Queued, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, Queued)
                | (Failed, DeadLetter)
                | (Created, Cancelled)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Scheduled, Cancelled)
                | (DeadLetter, Queued)
        )
    }

    /// Check a transition, returning `InvalidTransition` when it is not legal.
    pub fn check_transition(self, to: JobStatus) -> Result<(), PipelineError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition { from: self, to })
        }
    }

    /// States with no outgoing transitions.
    ///
    /// `dead_letter` is only terminal once purged, which is tracked on the job
    /// (`archived_at`), not in the status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Cancelled)
    }

    /// States an administrator may cancel from.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            JobStatus::Created | JobStatus::Pending | JobStatus::Queued | JobStatus::Scheduled
        )
    }

    /// States that close out delivery and carry `completed_at`.
    ///
    /// `dead_letter` is the non-retryable failure outcome; it loses
    /// `completed_at` again if an administrator requeues the job.
    pub fn sets_completed_at(self) -> bool {
        matches!(
            self,
            JobStatus::Sent | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown job status: {s}")))
    }
}
