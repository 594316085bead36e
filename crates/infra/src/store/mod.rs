//! Storage boundary for jobs, history, queues and tenant config.
//!
//! Backends hold the single shared mutable state of the pipeline. Every
//! mutation is an atomic, conditionally-applied update: the job's status is
//! checked against the caller's expectation and the change is rejected with
//! [`StoreError::Conflict`] when someone else got there first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jtd_core::delivery::{self, DeliveryFailure, DeliveryReceipt};
use jtd_core::{
    Actor, Channel, Job, JobId, JobPatch, JobStatus, MessageId, PipelineError, RetryPolicy,
    StatusHistoryEntry, TenantChannelConfig, TenantId,
};

use crate::metrics::{ActionableCounts, BreakdownRow, QueueDepth};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryPipelineStore;
pub use postgres::PostgresPipelineStore;

/// History reason recorded on jobs archived by a DLQ purge.
pub const PURGE_REASON: &str = "purged from dead-letter queue";

/// Backend error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("status changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error(transparent)]
    Transition(#[from] PipelineError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PipelineError::NotFound(id),
            StoreError::Conflict { expected, actual } => {
                PipelineError::ConflictingTransition { expected, actual }
            }
            StoreError::Transition(e) => e,
            StoreError::Storage(msg) => PipelineError::Storage(msg),
        }
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, 1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = (pagination.offset as u64 + items.len() as u64) < total;
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            pagination: self.pagination,
            has_more: self.has_more,
        }
    }
}

/// Filter for admin job listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<TenantId>,
    pub event_type: Option<String>,
    pub channel: Option<Channel>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        job.is_active
            && self.status.is_none_or(|s| s == job.current_status)
            && self.tenant_id.is_none_or(|t| t == job.tenant_id)
            && self
                .event_type
                .as_deref()
                .is_none_or(|e| e == job.event_type)
            && self.channel.is_none_or(|c| c == job.channel)
    }
}

/// Main queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub msg_id: MessageId,
    pub jtd_id: JobId,
    pub priority: i32,
    /// FIFO key within a priority tier (`not_before` at enqueue).
    pub sort_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub read_ct: u32,
    pub leased_by: Option<String>,
}

impl QueueEntry {
    /// Dequeue order: priority, then FIFO, then message id.
    pub fn order_key(&self) -> (i32, DateTime<Utc>, MessageId) {
        (self.priority, self.sort_at, self.msg_id)
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}

/// Dead-letter queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub msg_id: MessageId,
    pub jtd_id: JobId,
    pub read_ct: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A DLQ entry joined with its job.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqRecord {
    pub entry: DlqEntry,
    pub job: Job,
}

/// What a change does to the job's queue presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEffect {
    None,
    /// Insert or reset the job's main queue entry and drop any DLQ entry.
    Enqueue {
        priority: i32,
        not_before: DateTime<Utc>,
    },
    /// Drop the job's main queue entry.
    Remove,
    /// Move the job's main queue entry to the DLQ, or create one there.
    DeadLetter,
}

impl QueueEffect {
    /// Queue effect implied by entering `to` through the generic transition.
    pub fn for_target(job: &Job, to: JobStatus, now: DateTime<Utc>) -> Self {
        match (job.current_status, to) {
            (JobStatus::Scheduled, JobStatus::Queued) => QueueEffect::None,
            (_, JobStatus::Queued) => QueueEffect::Enqueue {
                priority: job.priority,
                not_before: now,
            },
            (_, JobStatus::DeadLetter) => QueueEffect::DeadLetter,
            (_, JobStatus::Sent | JobStatus::Cancelled | JobStatus::Failed) => QueueEffect::Remove,
            _ => QueueEffect::None,
        }
    }
}

/// The mutation carried by a [`JobChange`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Transition {
        to: JobStatus,
        reason: Option<String>,
        patch: JobPatch,
        queue: QueueEffect,
    },
    /// Worker reported delivery success.
    Succeed(DeliveryReceipt),
    /// Worker reported delivery failure; failed vs dead-letter is decided
    /// atomically from the locked row.
    Fail {
        failure: DeliveryFailure,
        policy: RetryPolicy,
    },
}

/// A conditional mutation of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobChange {
    pub job_id: JobId,
    /// Status the caller observed; the change only applies if it still holds.
    pub expected: JobStatus,
    pub mutation: Mutation,
    pub actor: Actor,
    /// Treat "already at the target status" as success (duplicate worker
    /// reports under at-least-once delivery).
    pub idempotent: bool,
}

impl JobChange {
    pub fn transition(
        job_id: JobId,
        expected: JobStatus,
        to: JobStatus,
        actor: Actor,
        reason: impl Into<String>,
        queue: QueueEffect,
    ) -> Self {
        Self {
            job_id,
            expected,
            mutation: Mutation::Transition {
                to,
                reason: Some(reason.into()),
                patch: JobPatch::default(),
                queue,
            },
            actor,
            idempotent: false,
        }
    }

    pub fn with_patch(mut self, new_patch: JobPatch) -> Self {
        if let Mutation::Transition { patch, .. } = &mut self.mutation {
            *patch = new_patch;
        }
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Whether `status` is an outcome this change could have produced.
    pub fn is_target(&self, status: JobStatus) -> bool {
        match &self.mutation {
            Mutation::Transition { to, .. } => *to == status,
            Mutation::Succeed(_) => status == JobStatus::Sent,
            Mutation::Fail { .. } => {
                matches!(status, JobStatus::Failed | JobStatus::DeadLetter)
            }
        }
    }

    /// Check the optimistic-concurrency precondition against `job`.
    ///
    /// `Ok(true)` means apply, `Ok(false)` means an idempotent duplicate.
    pub fn precondition(&self, job: &Job) -> StoreResult<bool> {
        if !job.is_active {
            return Err(StoreError::NotFound(job.id));
        }
        if job.current_status == self.expected {
            return Ok(true);
        }
        if self.idempotent && self.is_target(job.current_status) {
            return Ok(false);
        }
        Err(StoreError::Conflict {
            expected: self.expected,
            actual: job.current_status,
        })
    }

    /// Apply the mutation to a locked copy of the job.
    pub fn apply_to(
        &self,
        job: &mut Job,
        now: DateTime<Utc>,
    ) -> StoreResult<(StatusHistoryEntry, QueueEffect)> {
        match &self.mutation {
            Mutation::Transition {
                to,
                reason,
                patch,
                queue,
            } => {
                let entry = job.transition(*to, &self.actor, reason.clone(), patch.clone(), now)?;
                Ok((entry, *queue))
            }
            Mutation::Succeed(receipt) => {
                let entry = delivery::record_success(job, receipt, &self.actor, now)?;
                Ok((entry, QueueEffect::Remove))
            }
            Mutation::Fail { failure, policy } => {
                let entry = delivery::record_failure(job, failure, policy, &self.actor, now)?;
                let effect = if job.current_status == JobStatus::DeadLetter {
                    QueueEffect::DeadLetter
                } else {
                    QueueEffect::Remove
                };
                Ok((entry, effect))
            }
        }
    }
}

/// Result of [`PipelineStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    Applied {
        job: Job,
        entry: StatusHistoryEntry,
    },
    /// Idempotent duplicate; nothing was written.
    Unchanged { job: Job },
}

impl ChangeOutcome {
    pub fn job(&self) -> &Job {
        match self {
            ChangeOutcome::Applied { job, .. } | ChangeOutcome::Unchanged { job } => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            ChangeOutcome::Applied { job, .. } | ChangeOutcome::Unchanged { job } => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ChangeOutcome::Applied { .. })
    }
}

/// A leased main queue entry handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub msg_id: MessageId,
    pub job: Job,
    pub read_ct: u32,
    pub visible_until: DateTime<Utc>,
    /// True when the job was already `processing` under an expired lease.
    pub redelivery: bool,
}

/// Result of one lease call.
///
/// Entries skipped on the way (dead-lettered by lease exhaustion, or orphaned)
/// are reported so the caller can log them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseOutcome {
    pub lease: Option<Lease>,
    pub exhausted: Vec<JobId>,
    pub orphaned: Vec<MessageId>,
}

/// Depth and oldest entry of both queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub main: QueueDepth,
    pub dlq: QueueDepth,
}

/// Job store, status history and both queues behind one atomic boundary.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert a freshly admitted job with its history and main queue entry.
    async fn insert_job(
        &self,
        job: &Job,
        history: &[StatusHistoryEntry],
        not_before: DateTime<Utc>,
    ) -> StoreResult<MessageId>;

    /// Fetch a job, active or not.
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Conditionally apply a change, append its history entry and apply its
    /// queue effect in one atomic step.
    async fn apply(&self, change: JobChange, now: DateTime<Utc>) -> StoreResult<ChangeOutcome>;

    /// Lease the next visible entry by `(priority, sort_at, msg_id)`.
    async fn lease(
        &self,
        worker: &Actor,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome>;

    /// Remove a main queue entry. Returns false when it was already gone.
    async fn ack(&self, msg_id: MessageId) -> StoreResult<bool>;

    /// Make a leased entry visible again. Returns false when it is gone.
    async fn nack(&self, msg_id: MessageId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Active jobs eligible for promotion: `failed` past `next_retry_at` and
    /// `scheduled` past `scheduled_at`.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>>;

    async fn dlq_message(&self, msg_id: MessageId) -> StoreResult<Option<DlqRecord>>;

    /// DLQ entries, oldest first.
    async fn list_dlq(&self, page: Pagination) -> StoreResult<Page<DlqRecord>>;

    /// Delete every DLQ entry and archive its job, all or nothing.
    async fn purge_dlq(&self, actor: &Actor, now: DateTime<Utc>) -> StoreResult<Vec<JobId>>;

    /// Jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter, page: Pagination) -> StoreResult<Page<Job>>;

    /// History of a job, oldest first.
    async fn history(&self, id: JobId) -> StoreResult<Vec<StatusHistoryEntry>>;

    /// Most recently created active job for a source entity.
    async fn latest_for_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> StoreResult<Option<Job>>;

    /// Record a provider delivery receipt on a `sent` job.
    async fn mark_delivered(&self, id: JobId, at: DateTime<Utc>) -> StoreResult<Job>;

    async fn queue_stats(&self) -> StoreResult<QueueStats>;

    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, u64)>>;

    async fn actionable_counts(
        &self,
        now: DateTime<Utc>,
        blocking_codes: &[String],
    ) -> StoreResult<ActionableCounts>;

    async fn breakdown_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<BreakdownRow>>;
}

/// Tenant channel configuration rows.
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    async fn channel_config(
        &self,
        tenant_id: TenantId,
        source_type: &str,
    ) -> StoreResult<Option<TenantChannelConfig>>;

    async fn tenant_configs(&self, tenant_id: TenantId) -> StoreResult<Vec<TenantChannelConfig>>;

    async fn upsert_channel_config(&self, config: TenantChannelConfig) -> StoreResult<()>;
}

/// Both store traits behind one object, for callers that pick a backend at
/// runtime.
pub trait PipelineBackend: PipelineStore + TenantConfigStore {}

impl<T: PipelineStore + TenantConfigStore + ?Sized> PipelineBackend for T {}

/// A runtime-selected backend.
pub type SharedBackend = Arc<dyn PipelineBackend>;

macro_rules! delegate_store {
    ($wrapper:ident) => {
        #[async_trait]
        impl<S: PipelineStore + ?Sized> PipelineStore for $wrapper<S> {
            async fn insert_job(
                &self,
                job: &Job,
                history: &[StatusHistoryEntry],
                not_before: DateTime<Utc>,
            ) -> StoreResult<MessageId> {
                (**self).insert_job(job, history, not_before).await
            }
            async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
                (**self).get_job(id).await
            }
            async fn apply(
                &self,
                change: JobChange,
                now: DateTime<Utc>,
            ) -> StoreResult<ChangeOutcome> {
                (**self).apply(change, now).await
            }
            async fn lease(
                &self,
                worker: &Actor,
                visibility_timeout: chrono::Duration,
                now: DateTime<Utc>,
            ) -> StoreResult<LeaseOutcome> {
                (**self).lease(worker, visibility_timeout, now).await
            }
            async fn ack(&self, msg_id: MessageId) -> StoreResult<bool> {
                (**self).ack(msg_id).await
            }
            async fn nack(&self, msg_id: MessageId, now: DateTime<Utc>) -> StoreResult<bool> {
                (**self).nack(msg_id, now).await
            }
            async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>> {
                (**self).due_jobs(now, limit).await
            }
            async fn dlq_message(
                &self,
                msg_id: MessageId,
            ) -> StoreResult<Option<DlqRecord>> {
                (**self).dlq_message(msg_id).await
            }
            async fn list_dlq(&self, page: Pagination) -> StoreResult<Page<DlqRecord>> {
                (**self).list_dlq(page).await
            }
            async fn purge_dlq(
                &self,
                actor: &Actor,
                now: DateTime<Utc>,
            ) -> StoreResult<Vec<JobId>> {
                (**self).purge_dlq(actor, now).await
            }
            async fn list_jobs(
                &self,
                filter: &JobFilter,
                page: Pagination,
            ) -> StoreResult<Page<Job>> {
                (**self).list_jobs(filter, page).await
            }
            async fn history(&self, id: JobId) -> StoreResult<Vec<StatusHistoryEntry>> {
                (**self).history(id).await
            }
            async fn latest_for_source(
                &self,
                source_type: &str,
                source_id: &str,
            ) -> StoreResult<Option<Job>> {
                (**self).latest_for_source(source_type, source_id).await
            }
            async fn mark_delivered(&self, id: JobId, at: DateTime<Utc>) -> StoreResult<Job> {
                (**self).mark_delivered(id, at).await
            }
            async fn queue_stats(&self) -> StoreResult<QueueStats> {
                (**self).queue_stats().await
            }
            async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, u64)>> {
                (**self).status_counts().await
            }
            async fn actionable_counts(
                &self,
                now: DateTime<Utc>,
                blocking_codes: &[String],
            ) -> StoreResult<ActionableCounts> {
                (**self).actionable_counts(now, blocking_codes).await
            }
            async fn breakdown_since(
                &self,
                since: DateTime<Utc>,
            ) -> StoreResult<Vec<BreakdownRow>> {
                (**self).breakdown_since(since).await
            }
        }

        #[async_trait]
        impl<S: TenantConfigStore + ?Sized> TenantConfigStore for $wrapper<S> {
            async fn channel_config(
                &self,
                tenant_id: TenantId,
                source_type: &str,
            ) -> StoreResult<Option<TenantChannelConfig>> {
                (**self).channel_config(tenant_id, source_type).await
            }
            async fn tenant_configs(
                &self,
                tenant_id: TenantId,
            ) -> StoreResult<Vec<TenantChannelConfig>> {
                (**self).tenant_configs(tenant_id).await
            }
            async fn upsert_channel_config(&self, config: TenantChannelConfig) -> StoreResult<()> {
                (**self).upsert_channel_config(config).await
            }
        }
    };
}

delegate_store!(Arc);
