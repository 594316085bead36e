//! Admin recovery operations: retry, cancel, force-complete, DLQ requeue and
//! DLQ purge.
//!
//! Every operation reads a snapshot, checks its precondition against it and
//! then applies a change conditioned on the snapshot's status. Losing a race
//! surfaces as `ConflictingTransition`; nothing here is retried internally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use jtd_auth::{AuthzError, Principal, Role, require_role};
use jtd_core::{
    Actor, Job, JobId, JobPatch, JobStatus, MessageId, PipelineError, PipelineResult,
};

use crate::config::PipelineConfig;
use crate::store::{JobChange, PipelineStore, QueueEffect};

pub const REASON_MANUAL_RETRY: &str = "manual retry";
pub const REASON_CANCELLED: &str = "cancelled by administrator";
pub const REASON_ADMIN_OVERRIDE: &str = "admin override";
pub const REASON_REQUEUED: &str = "requeued from dead-letter queue";
pub const FORCE_FAILED_MESSAGE: &str = "force-completed as failed by administrator";

/// An administrator allowed to run recovery operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminActor(Actor);

impl AdminActor {
    /// Build from an authenticated principal holding the admin role.
    pub fn from_principal(principal: &Principal) -> Result<Self, AuthzError> {
        require_role(principal, &Role::ADMIN)?;
        Ok(Self(Actor::admin(principal.name.clone())))
    }

    /// An administrator identified by name only, for tooling and tests.
    pub fn named(name: impl Into<String>) -> Self {
        Self(Actor::admin(name))
    }

    pub fn actor(&self) -> &Actor {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl TryFrom<&Principal> for AdminActor {
    type Error = AuthzError;

    fn try_from(principal: &Principal) -> Result<Self, Self::Error> {
        Self::from_principal(principal)
    }
}

/// Outcome an administrator can force on a `processing` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceOutcome {
    Sent,
    /// Dead-letters the job.
    Failed,
}

impl ForceOutcome {
    pub fn target(self) -> JobStatus {
        match self {
            ForceOutcome::Sent => JobStatus::Sent,
            ForceOutcome::Failed => JobStatus::DeadLetter,
        }
    }
}

/// Audit record of a DLQ purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub purged: usize,
    pub job_ids: Vec<JobId>,
    pub actor: String,
    pub purged_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Recovery<S> {
    store: S,
    default_priority: i32,
}

impl<S: PipelineStore> Recovery<S> {
    pub fn new(store: S, config: &PipelineConfig) -> Self {
        Self {
            store,
            default_priority: config.default_priority,
        }
    }

    /// `failed -> queued` at the job's own priority. `retry_count` is kept.
    pub async fn retry(&self, job_id: JobId, admin: &AdminActor) -> PipelineResult<Job> {
        let now = Utc::now();
        let job = self.active_job(job_id).await?;
        if job.current_status != JobStatus::Failed {
            return Err(PipelineError::NotRetryable {
                status: job.current_status,
            });
        }

        let change = JobChange::transition(
            job_id,
            JobStatus::Failed,
            JobStatus::Queued,
            admin.actor().clone(),
            REASON_MANUAL_RETRY,
            QueueEffect::Enqueue {
                priority: job.priority,
                not_before: now,
            },
        );
        let job = self.store.apply(change, now).await?.into_job();
        info!(%job_id, admin = admin.name(), retry_count = job.retry_count, "job retried");
        Ok(job)
    }

    /// Cancel a job that has not reached a worker yet.
    pub async fn cancel(&self, job_id: JobId, admin: &AdminActor) -> PipelineResult<Job> {
        let now = Utc::now();
        let job = self.active_job(job_id).await?;
        if !job.current_status.is_cancellable() {
            return Err(PipelineError::NotCancellable {
                status: job.current_status,
            });
        }

        let change = JobChange::transition(
            job_id,
            job.current_status,
            JobStatus::Cancelled,
            admin.actor().clone(),
            REASON_CANCELLED,
            QueueEffect::Remove,
        );
        let job = self.store.apply(change, now).await?.into_job();
        info!(%job_id, admin = admin.name(), "job cancelled");
        Ok(job)
    }

    /// Settle a `processing` job without waiting for its worker.
    pub async fn force_complete(
        &self,
        job_id: JobId,
        outcome: ForceOutcome,
        admin: &AdminActor,
    ) -> PipelineResult<Job> {
        let now = Utc::now();
        let job = self.active_job(job_id).await?;
        if job.current_status != JobStatus::Processing {
            return Err(PipelineError::NotInProcessing {
                status: job.current_status,
            });
        }

        let (queue, patch) = match outcome {
            ForceOutcome::Sent => (QueueEffect::Remove, JobPatch::default()),
            ForceOutcome::Failed => (
                QueueEffect::DeadLetter,
                JobPatch::error(None, FORCE_FAILED_MESSAGE),
            ),
        };
        let change = JobChange::transition(
            job_id,
            JobStatus::Processing,
            outcome.target(),
            admin.actor().clone(),
            REASON_ADMIN_OVERRIDE,
            queue,
        )
        .with_patch(patch);

        let job = self.store.apply(change, now).await?.into_job();
        info!(%job_id, admin = admin.name(), outcome = ?outcome, "job force-completed");
        Ok(job)
    }

    /// Move a DLQ message back to the main queue at the default priority.
    pub async fn requeue_from_dlq(
        &self,
        msg_id: MessageId,
        admin: &AdminActor,
    ) -> PipelineResult<Job> {
        let now = Utc::now();
        let record = self
            .store
            .dlq_message(msg_id)
            .await?
            .ok_or(PipelineError::DlqMessageNotFound(msg_id))?;
        let job_id = record.job.id;
        if !record.job.is_active {
            return Err(PipelineError::NotFound(job_id));
        }

        let change = JobChange::transition(
            job_id,
            record.job.current_status,
            JobStatus::Queued,
            admin.actor().clone(),
            REASON_REQUEUED,
            QueueEffect::Enqueue {
                priority: self.default_priority,
                not_before: now,
            },
        );
        let job = self.store.apply(change, now).await?.into_job();
        info!(%job_id, %msg_id, admin = admin.name(), "job requeued from dead-letter queue");
        Ok(job)
    }

    /// Delete every DLQ message and archive its job, all or nothing.
    pub async fn purge_dlq(&self, admin: &AdminActor) -> PipelineResult<PurgeReport> {
        let now = Utc::now();
        let job_ids = self.store.purge_dlq(admin.actor(), now).await?;

        warn!(
            admin = admin.name(),
            purged = job_ids.len(),
            "dead-letter queue purged"
        );
        Ok(PurgeReport {
            purged: job_ids.len(),
            job_ids,
            actor: admin.name().to_string(),
            purged_at: now,
        })
    }

    async fn active_job(&self, job_id: JobId) -> PipelineResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .filter(|job| job.is_active)
            .ok_or(PipelineError::NotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jtd_auth::{JwtClaims, PrincipalId};
    use jtd_core::delivery::DeliveryFailure;
    use jtd_core::{ActorKind, Channel, NewJob, RetryPolicy, TenantId};

    use crate::pipeline::Pipeline;
    use crate::store::InMemoryPipelineStore;

    struct Harness {
        store: Arc<InMemoryPipelineStore>,
        pipeline: Pipeline<Arc<InMemoryPipelineStore>>,
        recovery: Recovery<Arc<InMemoryPipelineStore>>,
        admin: AdminActor,
        worker: Actor,
    }

    fn harness() -> Harness {
        let store = InMemoryPipelineStore::arc();
        let config = PipelineConfig::default()
            .with_retry_policy(RetryPolicy::immediate())
            .with_default_priority(7);
        Harness {
            pipeline: Pipeline::new(store.clone(), config.clone()),
            recovery: Recovery::new(store.clone(), &config),
            store,
            admin: AdminActor::named("ops"),
            worker: Actor::worker("w1"),
        }
    }

    async fn create(h: &Harness, max_retries: u32) -> JobId {
        let request = NewJob::new(
            TenantId::new(),
            Channel::Email,
            "user.invited",
            "user_invite",
            "inv-1",
        )
        .with_email("ada@example.com")
        .with_priority(1)
        .with_max_retries(max_retries);
        h.pipeline.create_job(request).await.unwrap().job_id().unwrap()
    }

    #[test]
    fn admin_actor_requires_admin_role() {
        let now = Utc::now();
        let claims = |roles| JwtClaims {
            sub: PrincipalId::new(),
            name: Some("grace".to_string()),
            roles,
            issued_at: now,
            expires_at: now,
        };

        let admin = AdminActor::try_from(&Principal::from(claims(vec![Role::ADMIN]))).unwrap();
        assert_eq!(admin.name(), "grace");
        assert_eq!(admin.actor().kind, ActorKind::Admin);

        let service = Principal::from(claims(vec![Role::SERVICE]));
        assert!(AdminActor::try_from(&service).is_err());
    }

    #[tokio::test]
    async fn retry_requires_failed_job() {
        let h = harness();
        let id = create(&h, 3).await;

        let err = h.recovery.retry(id, &h.admin).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::NotRetryable {
                status: JobStatus::Queued
            }
        );
    }

    #[tokio::test]
    async fn retry_keeps_retry_count_and_priority() {
        let h = harness();
        let id = create(&h, 3).await;
        let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
        h.pipeline
            .report_failure(&h.worker, &lease, DeliveryFailure::new("bounce"))
            .await
            .unwrap();

        let job = h.recovery.retry(id, &h.admin).await.unwrap();
        assert_eq!(job.current_status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(h.store.main_entry(id).unwrap().unwrap().priority, 1);

        let history = h.store.history(id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.reason.as_deref(), Some(REASON_MANUAL_RETRY));
        assert_eq!(last.performed_by_type, ActorKind::Admin);
    }

    #[tokio::test]
    async fn cancel_removes_queue_entry() {
        let h = harness();
        let id = create(&h, 3).await;

        let job = h.recovery.cancel(id, &h.admin).await.unwrap();
        assert_eq!(job.current_status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
        assert!(h.store.main_entry(id).unwrap().is_none());
        assert!(h.pipeline.lease(&h.worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_of_processing_job_is_refused() {
        let h = harness();
        let id = create(&h, 3).await;
        h.pipeline.lease(&h.worker).await.unwrap().unwrap();

        let err = h.recovery.cancel(id, &h.admin).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::NotCancellable {
                status: JobStatus::Processing
            }
        );
    }

    #[tokio::test]
    async fn force_complete_failed_dead_letters_job() {
        let h = harness();
        let id = create(&h, 3).await;
        h.pipeline.lease(&h.worker).await.unwrap().unwrap();

        let job = h
            .recovery
            .force_complete(id, ForceOutcome::Failed, &h.admin)
            .await
            .unwrap();
        assert_eq!(job.current_status, JobStatus::DeadLetter);
        assert_eq!(job.error_message.as_deref(), Some(FORCE_FAILED_MESSAGE));
        assert!(h.store.main_entry(id).unwrap().is_none());
        assert!(h.store.dlq_entry(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn force_complete_requires_processing() {
        let h = harness();
        let id = create(&h, 3).await;

        let err = h
            .recovery
            .force_complete(id, ForceOutcome::Sent, &h.admin)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::NotInProcessing {
                status: JobStatus::Queued
            }
        );
    }

    #[tokio::test]
    async fn requeue_uses_default_priority_and_unknown_message_is_reported() {
        let h = harness();
        let id = create(&h, 1).await;
        let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
        h.pipeline
            .report_failure(&h.worker, &lease, DeliveryFailure::new("bounce"))
            .await
            .unwrap();
        let dlq = h.store.dlq_entry(id).unwrap().unwrap();

        let job = h.recovery.requeue_from_dlq(dlq.msg_id, &h.admin).await.unwrap();
        assert_eq!(job.current_status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(h.store.dlq_entry(id).unwrap().is_none());
        assert_eq!(h.store.main_entry(id).unwrap().unwrap().priority, 7);

        let err = h
            .recovery
            .requeue_from_dlq(dlq.msg_id, &h.admin)
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::DlqMessageNotFound(dlq.msg_id));
    }

    #[tokio::test]
    async fn purge_of_empty_dlq_reports_zero() {
        let h = harness();
        let report = h.recovery.purge_dlq(&h.admin).await.unwrap();
        assert_eq!(report.purged, 0);
        assert_eq!(report.actor, "ops");
    }
}
