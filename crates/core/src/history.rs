//! Append-only status history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{HistoryId, JobId};
use crate::job::{Actor, ActorKind};
use crate::status::JobStatus;

/// One audited transition of a job.
///
/// Entries are created on every transition and never updated or deleted.
/// They reference the job by id only, so they outlive the job's queue
/// presence and any archival of the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: HistoryId,
    pub jtd_id: JobId,
    /// `None` for the creation entry.
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    /// Seconds spent in `from_status`.
    pub duration_seconds: i64,
    pub performed_by_type: ActorKind,
    pub performed_by_name: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn new(
        jtd_id: JobId,
        from_status: Option<JobStatus>,
        to_status: JobStatus,
        duration_seconds: i64,
        actor: &Actor,
        reason: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HistoryId::new(),
            jtd_id,
            from_status,
            to_status,
            duration_seconds: duration_seconds.max(0),
            performed_by_type: actor.kind,
            performed_by_name: actor.name.clone(),
            reason,
            created_at,
        }
    }
}
