//! The pipeline service: job creation, state transitions, queue leasing and
//! worker outcome reporting over a [`PipelineStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jtd_core::delivery::{self, DeliveryFailure, DeliveryReceipt};
use jtd_core::{
    Actor, Channel, Job, JobId, JobStatus, MessageId, NewJob, PipelineError, PipelineResult,
    RetryPolicy, StatusHistoryEntry,
};

use crate::config::PipelineConfig;
use crate::gate::ChannelGate;
use crate::metrics::{QueueMetricsAggregator, QueueMetricsSnapshot};
use crate::store::{
    ChangeOutcome, DlqRecord, JobChange, JobFilter, Lease, Mutation, Page, Pagination,
    PipelineStore, QueueEffect, StoreError, TenantConfigStore,
};

/// Due jobs promoted per `promote_due` call.
const PROMOTE_BATCH: u32 = 100;

pub const REASON_AUTOMATIC_RETRY: &str = "automatic retry";

/// Result of a creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created {
        jtd_id: JobId,
        msg_id: MessageId,
        status: JobStatus,
    },
    /// The tenant disabled the channel. Not an error.
    Skipped { reason: String },
}

impl CreateOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CreateOutcome::Created { jtd_id, .. } => Some(*jtd_id),
            CreateOutcome::Skipped { .. } => None,
        }
    }
}

/// Delivery state of the latest job for a source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub jtd_id: JobId,
    pub status: JobStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            jtd_id: job.id,
            status: job.current_status,
            sent_at: job.sent_at,
            delivered_at: job.delivered_at,
            error: job.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub history: Vec<StatusHistoryEntry>,
}

/// A DLQ entry as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub msg_id: MessageId,
    pub jtd_id: JobId,
    pub tenant_name: Option<String>,
    pub event_type: String,
    pub channel: Channel,
    pub error_message: Option<String>,
    pub age_seconds: i64,
    pub read_ct: u32,
    pub is_poison: bool,
}

impl DlqMessage {
    pub fn from_record(record: DlqRecord, now: DateTime<Utc>, poison_read_threshold: u32) -> Self {
        let DlqRecord { entry, job } = record;
        Self {
            msg_id: entry.msg_id,
            jtd_id: entry.jtd_id,
            tenant_name: job.tenant_name,
            event_type: job.event_type,
            channel: job.channel,
            error_message: job.error_message,
            age_seconds: (now - entry.enqueued_at).num_seconds().max(0),
            read_ct: entry.read_ct,
            is_poison: entry.read_ct >= poison_read_threshold,
        }
    }
}

/// Jobs moved back to `queued` by one `promote_due` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromoteReport {
    pub retried: Vec<JobId>,
    pub woken: Vec<JobId>,
}

impl PromoteReport {
    pub fn is_empty(&self) -> bool {
        self.retried.is_empty() && self.woken.is_empty()
    }
}

/// Pipeline service.
///
/// Cheap to clone when the store is (e.g. an `Arc`).
#[derive(Debug, Clone)]
pub struct Pipeline<S> {
    store: S,
    gate: ChannelGate<S>,
    config: PipelineConfig,
}

impl<S> Pipeline<S>
where
    S: PipelineStore + TenantConfigStore + Clone,
{
    pub fn new(store: S, config: PipelineConfig) -> Self {
        Self {
            gate: ChannelGate::new(store.clone()),
            store,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gate(&self) -> &ChannelGate<S> {
        &self.gate
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    pub async fn create_job(&self, request: NewJob) -> PipelineResult<CreateOutcome> {
        self.create_job_at(request, Utc::now()).await
    }

    /// Validate, gate, build and admit a job in one store call.
    ///
    /// A disabled channel yields `Skipped` rather than an error.
    pub async fn create_job_at(
        &self,
        request: NewJob,
        now: DateTime<Utc>,
    ) -> PipelineResult<CreateOutcome> {
        request.validate()?;

        let tenant_id = request.tenant_id;
        let channel = request.channel;
        if !self
            .gate
            .is_channel_enabled(tenant_id, &request.source_type, channel)
            .await?
        {
            info!(
                %tenant_id,
                source_type = %request.source_type,
                %channel,
                event_type = %request.event_type,
                "channel disabled for tenant; job skipped"
            );
            return Ok(CreateOutcome::Skipped {
                reason: format!(
                    "{} notifications are disabled for {}",
                    channel, request.source_type
                ),
            });
        }

        let is_live = self.gate.resolve_is_live(tenant_id).await?;
        let mut job = Job::from_request(
            request,
            self.config.default_priority,
            self.config.default_max_retries,
            is_live,
            now,
        );
        let mut history = vec![job.creation_entry()];
        history.extend(job.admit(now)?);

        let msg_id = self
            .store
            .insert_job(&job, &history, job.not_before(now))
            .await?;

        info!(
            job_id = %job.id,
            %msg_id,
            %tenant_id,
            %channel,
            event_type = %job.event_type,
            status = %job.current_status,
            is_live,
            "job created"
        );
        Ok(CreateOutcome::Created {
            jtd_id: job.id,
            msg_id,
            status: job.current_status,
        })
    }

    /// Move a job to `to` on behalf of `actor`.
    ///
    /// `to` equal to the current status is a no-op. The queue follows the
    /// status: entering `queued` enqueues, entering `dead_letter` moves the
    /// entry to the DLQ, entering any other settled state removes it.
    pub async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        actor: &Actor,
        reason: Option<String>,
    ) -> PipelineResult<ChangeOutcome> {
        let now = Utc::now();
        let job = self.active_job(job_id).await?;
        if job.current_status == to {
            return Ok(ChangeOutcome::Unchanged { job });
        }
        job.current_status.check_transition(to)?;

        let change = JobChange {
            job_id,
            expected: job.current_status,
            mutation: Mutation::Transition {
                to,
                reason,
                patch: Default::default(),
                queue: QueueEffect::for_target(&job, to, now),
            },
            actor: actor.clone(),
            idempotent: false,
        };
        let outcome = self.store.apply(change, now).await?;
        debug!(%job_id, from = %job.current_status, %to, %actor, "job transitioned");
        Ok(outcome)
    }

    pub async fn lease(&self, worker: &Actor) -> PipelineResult<Option<Lease>> {
        self.lease_at(worker, Utc::now()).await
    }

    /// Lease the next visible entry for `worker`.
    pub async fn lease_at(
        &self,
        worker: &Actor,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<Lease>> {
        let outcome = self
            .store
            .lease(worker, self.visibility_timeout(), now)
            .await?;

        for job_id in &outcome.exhausted {
            warn!(%job_id, worker = %worker.name, "lease expired too often; job dead-lettered");
        }
        for msg_id in &outcome.orphaned {
            warn!(%msg_id, worker = %worker.name, "removed orphaned queue entry");
        }
        if let Some(lease) = &outcome.lease {
            debug!(
                job_id = %lease.job.id,
                msg_id = %lease.msg_id,
                read_ct = lease.read_ct,
                redelivery = lease.redelivery,
                worker = %worker.name,
                "leased job"
            );
        }
        Ok(outcome.lease)
    }

    /// Remove a queue entry. Acking twice is not an error.
    pub async fn ack(&self, msg_id: MessageId) -> PipelineResult<bool> {
        Ok(self.store.ack(msg_id).await?)
    }

    /// Make a leased entry visible again.
    pub async fn nack(&self, msg_id: MessageId) -> PipelineResult<bool> {
        Ok(self.store.nack(msg_id, Utc::now()).await?)
    }

    /// Record a successful delivery and ack the entry.
    ///
    /// A duplicate report for an already `sent` job returns `Unchanged`.
    pub async fn report_success(
        &self,
        worker: &Actor,
        lease: &Lease,
        receipt: DeliveryReceipt,
    ) -> PipelineResult<ChangeOutcome> {
        let change = JobChange {
            job_id: lease.job.id,
            expected: JobStatus::Processing,
            mutation: Mutation::Succeed(receipt),
            actor: worker.clone(),
            idempotent: true,
        };
        let outcome = self.store.apply(change, Utc::now()).await?;
        self.store.ack(lease.msg_id).await?;

        if outcome.is_applied() {
            info!(job_id = %lease.job.id, worker = %worker.name, "job delivered");
        } else {
            debug!(job_id = %lease.job.id, "duplicate success report ignored");
        }
        Ok(outcome)
    }

    /// Record a failed delivery.
    ///
    /// The job becomes `failed` with a backoff, or `dead_letter` once its
    /// retries are used up; both are decided in the same atomic update.
    pub async fn report_failure(
        &self,
        worker: &Actor,
        lease: &Lease,
        failure: DeliveryFailure,
    ) -> PipelineResult<ChangeOutcome> {
        let change = JobChange {
            job_id: lease.job.id,
            expected: JobStatus::Processing,
            mutation: Mutation::Fail {
                failure: failure.clone(),
                policy: self.config.retry.clone(),
            },
            actor: worker.clone(),
            idempotent: true,
        };
        let outcome = self.store.apply(change, Utc::now()).await?;
        self.store.ack(lease.msg_id).await?;

        let job = outcome.job();
        match (outcome.is_applied(), job.current_status) {
            (true, JobStatus::DeadLetter) => warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                error = %failure.message,
                "delivery failed; retries exhausted, job dead-lettered"
            ),
            (true, _) => info!(
                job_id = %job.id,
                retry_count = job.retry_count,
                next_retry_at = ?job.next_retry_at,
                error = %failure.message,
                "delivery failed; will retry"
            ),
            (false, _) => debug!(job_id = %job.id, "duplicate failure report ignored"),
        }
        Ok(outcome)
    }

    /// Return due jobs to `queued`: failed jobs past their backoff and
    /// scheduled jobs past `scheduled_at`.
    ///
    /// Jobs changed concurrently are skipped.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> PipelineResult<PromoteReport> {
        let mut report = PromoteReport::default();
        for job in self.store.due_jobs(now, PROMOTE_BATCH).await? {
            let (reason, queue) = match job.current_status {
                JobStatus::Failed => (
                    REASON_AUTOMATIC_RETRY,
                    QueueEffect::Enqueue {
                        priority: job.priority,
                        not_before: now,
                    },
                ),
                JobStatus::Scheduled => (delivery::REASON_SCHEDULE_DUE, QueueEffect::None),
                _ => continue,
            };

            let change = JobChange::transition(
                job.id,
                job.current_status,
                JobStatus::Queued,
                Actor::system(),
                reason,
                queue,
            );
            match self.store.apply(change, now).await {
                Ok(_) if job.current_status == JobStatus::Failed => report.retried.push(job.id),
                Ok(_) => report.woken.push(job.id),
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(job_id = %job.id, %actual, "due job changed concurrently; skipped");
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !report.is_empty() {
            debug!(
                retried = report.retried.len(),
                woken = report.woken.len(),
                "promoted due jobs"
            );
        }
        Ok(report)
    }

    /// Delivery state of the most recent job for a source entity.
    pub async fn get_status(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> PipelineResult<Option<JobStatusView>> {
        let job = self.store.latest_for_source(source_type, source_id).await?;
        Ok(job.as_ref().map(JobStatusView::from))
    }

    pub async fn job_detail(&self, job_id: JobId) -> PipelineResult<JobDetail> {
        let job = self.active_job(job_id).await?;
        let history = self.store.history(job_id).await?;
        Ok(JobDetail { job, history })
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> PipelineResult<Page<Job>> {
        Ok(self.store.list_jobs(filter, page).await?)
    }

    pub async fn list_dlq(&self, page: Pagination) -> PipelineResult<Page<DlqMessage>> {
        let now = Utc::now();
        let threshold = self.config.poison_read_threshold;
        let page = self.store.list_dlq(page).await?;
        Ok(page.map(|record| DlqMessage::from_record(record, now, threshold)))
    }

    /// Record a provider delivery receipt on a `sent` job.
    pub async fn mark_delivered(&self, job_id: JobId, at: DateTime<Utc>) -> PipelineResult<Job> {
        Ok(self.store.mark_delivered(job_id, at).await?)
    }

    pub async fn metrics(&self) -> PipelineResult<QueueMetricsSnapshot> {
        QueueMetricsAggregator::new(self.store.clone(), &self.config)
            .snapshot()
            .await
    }

    /// Fetch an active job or fail with `NotFound`.
    pub(crate) async fn active_job(&self, job_id: JobId) -> PipelineResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .filter(|job| job.is_active)
            .ok_or(PipelineError::NotFound(job_id))
    }

    fn visibility_timeout(&self) -> chrono::Duration {
        self.config.visibility_timeout_chrono()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jtd_core::{TenantChannelConfig, TenantId};

    use crate::store::InMemoryPipelineStore;

    type TestPipeline = Pipeline<Arc<InMemoryPipelineStore>>;

    fn pipeline() -> (Arc<InMemoryPipelineStore>, TestPipeline) {
        let store = InMemoryPipelineStore::arc();
        let config = PipelineConfig::default().with_retry_policy(RetryPolicy::immediate());
        (store.clone(), Pipeline::new(store, config))
    }

    fn invite(tenant: TenantId) -> NewJob {
        NewJob::new(tenant, Channel::Email, "user.invited", "user_invite", "inv-1")
            .with_email("ada@example.com")
    }

    #[tokio::test]
    async fn created_job_is_admitted_and_queued() {
        let (store, pipeline) = pipeline();
        let outcome = pipeline.create_job(invite(TenantId::new())).await.unwrap();

        let CreateOutcome::Created { jtd_id, status, .. } = outcome else {
            panic!("expected a created job");
        };
        assert_eq!(status, JobStatus::Queued);
        assert!(store.main_entry(jtd_id).unwrap().is_some());

        let detail = pipeline.job_detail(jtd_id).await.unwrap();
        let trail: Vec<_> = detail.history.iter().map(|h| h.to_status).collect();
        assert_eq!(
            trail,
            vec![JobStatus::Created, JobStatus::Pending, JobStatus::Queued]
        );
        // no channel config rows
        assert!(!detail.job.is_live);
    }

    #[tokio::test]
    async fn disabled_channel_skips_creation() {
        let (store, pipeline) = pipeline();
        let tenant = TenantId::new();
        store
            .upsert_channel_config(
                TenantChannelConfig::new(tenant, "user_invite").with_channel(Channel::Email, false),
            )
            .await
            .unwrap();

        let outcome = pipeline.create_job(invite(tenant)).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Skipped { .. }));

        let page = pipeline
            .list_jobs(&JobFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let (_, pipeline) = pipeline();
        let request = NewJob::new(TenantId::new(), Channel::Sms, "otp", "login", "u-1");

        let err = pipeline.create_job(request).await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn huge_visibility_timeout_is_capped_at_lease() {
        let store = InMemoryPipelineStore::arc();
        let config = PipelineConfig::default()
            .with_visibility_timeout(std::time::Duration::from_secs(9_000_000_000_000));
        let pipeline = Pipeline::new(store, config);
        let worker = Actor::worker("w");
        pipeline.create_job(invite(TenantId::new())).await.unwrap();

        let now = Utc::now();
        let lease = pipeline.lease_at(&worker, now).await.unwrap().unwrap();
        let cap = chrono::Duration::from_std(crate::config::MAX_VISIBILITY_TIMEOUT).unwrap();
        assert_eq!(lease.visible_until, now + cap);

        let again = pipeline.create_job(invite(TenantId::new())).await.unwrap();
        assert!(again.job_id().is_some());
    }

    #[tokio::test]
    async fn scheduled_job_is_not_leased_before_due() {
        let (_, pipeline) = pipeline();
        let now = Utc::now();
        let request = invite(TenantId::new()).scheduled_at(now + chrono::Duration::hours(1));

        let outcome = pipeline.create_job_at(request, now).await.unwrap();
        assert!(matches!(
            outcome,
            CreateOutcome::Created {
                status: JobStatus::Scheduled,
                ..
            }
        ));

        let worker = Actor::worker("w1");
        assert!(pipeline.lease_at(&worker, now).await.unwrap().is_none());

        let later = now + chrono::Duration::hours(2);
        let lease = pipeline.lease_at(&worker, later).await.unwrap().unwrap();
        assert_eq!(lease.job.current_status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn promote_due_wakes_scheduled_jobs_without_requeueing() {
        let (store, pipeline) = pipeline();
        let now = Utc::now();
        let request = invite(TenantId::new()).scheduled_at(now + chrono::Duration::minutes(5));
        let id = pipeline
            .create_job_at(request, now)
            .await
            .unwrap()
            .job_id()
            .unwrap();
        let msg_before = store.main_entry(id).unwrap().unwrap().msg_id;

        let report = pipeline
            .promote_due(now + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(report.woken, vec![id]);
        assert!(report.retried.is_empty());

        let job = pipeline.job_detail(id).await.unwrap().job;
        assert_eq!(job.current_status, JobStatus::Queued);
        assert_eq!(store.main_entry(id).unwrap().unwrap().msg_id, msg_before);
    }

    #[tokio::test]
    async fn same_status_transition_is_a_no_op() {
        let (_, pipeline) = pipeline();
        let id = pipeline
            .create_job(invite(TenantId::new()))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        let outcome = pipeline
            .transition(id, JobStatus::Queued, &Actor::system(), None)
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(pipeline.job_detail(id).await.unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_state_kept() {
        let (_, pipeline) = pipeline();
        let id = pipeline
            .create_job(invite(TenantId::new()))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        let err = pipeline
            .transition(id, JobStatus::Sent, &Actor::system(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(
            pipeline.job_detail(id).await.unwrap().job.current_status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (_, pipeline) = pipeline();
        let err = pipeline
            .transition(JobId::new(), JobStatus::Cancelled, &Actor::system(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_query_reports_latest_job_and_delivery_receipt() {
        let (_, pipeline) = pipeline();
        let tenant = TenantId::new();
        pipeline.create_job(invite(tenant)).await.unwrap();

        let worker = Actor::worker("w1");
        let lease = pipeline.lease(&worker).await.unwrap().unwrap();
        pipeline
            .report_success(&worker, &lease, DeliveryReceipt::new("smtp"))
            .await
            .unwrap();

        let at = Utc::now();
        pipeline.mark_delivered(lease.job.id, at).await.unwrap();

        let view = pipeline
            .get_status("user_invite", "inv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, JobStatus::Sent);
        assert!(view.sent_at.is_some());
        assert_eq!(view.delivered_at, Some(at));
        assert!(pipeline.get_status("user_invite", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_then_promotion_requeues_at_job_priority() {
        let (store, pipeline) = pipeline();
        let id = pipeline
            .create_job(invite(TenantId::new()).with_priority(2))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        let worker = Actor::worker("w1");
        let lease = pipeline.lease(&worker).await.unwrap().unwrap();
        let outcome = pipeline
            .report_failure(&worker, &lease, DeliveryFailure::new("smtp timeout"))
            .await
            .unwrap();
        assert_eq!(outcome.job().current_status, JobStatus::Failed);
        assert!(store.main_entry(id).unwrap().is_none());

        let report = pipeline.promote_due(Utc::now()).await.unwrap();
        assert_eq!(report.retried, vec![id]);

        let entry = store.main_entry(id).unwrap().unwrap();
        assert_eq!(entry.priority, 2);
        let job = pipeline.job_detail(id).await.unwrap().job;
        assert_eq!(job.current_status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
    }
}
