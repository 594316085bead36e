//! End-to-end pipeline scenarios against the in-memory backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Barrier;

use jtd_core::delivery::{DeliveryFailure, DeliveryReceipt};
use jtd_core::{
    Actor, Channel, Job, JobId, JobStatus, MessageId, NewJob, PipelineError, RetryPolicy,
    StatusHistoryEntry, TenantId,
};
use jtd_infra::metrics::{ActionableCounts, BreakdownRow};
use jtd_infra::store::{
    ChangeOutcome, DlqRecord, JobChange, JobFilter, LeaseOutcome, Page, Pagination,
    PipelineStore, QueueStats, StoreResult,
};
use jtd_infra::{
    AdminActor, ForceOutcome, InMemoryPipelineStore, Pipeline, PipelineConfig, Recovery,
};

type Store = Arc<InMemoryPipelineStore>;

struct Harness {
    store: Store,
    pipeline: Pipeline<Store>,
    recovery: Recovery<Store>,
    admin: AdminActor,
    worker: Actor,
}

fn harness() -> Harness {
    let store = InMemoryPipelineStore::arc();
    let config = PipelineConfig::default().with_retry_policy(RetryPolicy::immediate());
    Harness {
        pipeline: Pipeline::new(store.clone(), config.clone()),
        recovery: Recovery::new(store.clone(), &config),
        store,
        admin: AdminActor::named("ops"),
        worker: Actor::worker("worker-1"),
    }
}

fn invite(n: usize, max_retries: u32) -> NewJob {
    NewJob::new(
        TenantId::new(),
        Channel::Email,
        "user.invited",
        "user_invite",
        format!("inv-{n}"),
    )
    .with_email("ada@example.com")
    .with_max_retries(max_retries)
}

async fn create(h: &Harness, n: usize, max_retries: u32) -> JobId {
    h.pipeline
        .create_job(invite(n, max_retries))
        .await
        .unwrap()
        .job_id()
        .unwrap()
}

async fn lease_and_fail(h: &Harness, expected: JobId) -> Job {
    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    assert_eq!(lease.job.id, expected);
    h.pipeline
        .report_failure(&h.worker, &lease, DeliveryFailure::new("mailbox unavailable"))
        .await
        .unwrap()
        .into_job()
}

fn transitions(history: &[StatusHistoryEntry]) -> Vec<(Option<JobStatus>, JobStatus)> {
    history.iter().map(|h| (h.from_status, h.to_status)).collect()
}

#[tokio::test]
async fn requeued_dead_letter_is_delivered_with_exact_trail() {
    let h = harness();
    let id = create(&h, 1, 1).await;
    let job = lease_and_fail(&h, id).await;
    assert_eq!(job.current_status, JobStatus::DeadLetter);

    let dlq = h.store.dlq_entry(id).unwrap().unwrap();
    let before = h.store.history(id).await.unwrap().len();

    h.recovery.requeue_from_dlq(dlq.msg_id, &h.admin).await.unwrap();
    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    h.pipeline
        .report_success(&h.worker, &lease, DeliveryReceipt::new("smtp"))
        .await
        .unwrap();

    let detail = h.pipeline.job_detail(id).await.unwrap();
    assert_eq!(detail.job.current_status, JobStatus::Sent);
    assert_eq!(
        transitions(&detail.history[before..]),
        vec![
            (Some(JobStatus::DeadLetter), JobStatus::Queued),
            (Some(JobStatus::Queued), JobStatus::Processing),
            (Some(JobStatus::Processing), JobStatus::Sent),
        ]
    );
    assert!(h.store.main_entry(id).unwrap().is_none());
    assert!(h.store.dlq_entry(id).unwrap().is_none());
}

#[tokio::test]
async fn purge_archives_every_dead_letter() {
    let h = harness();
    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(create(&h, n, 1).await);
    }
    for id in &ids {
        lease_and_fail(&h, *id).await;
    }
    let page = h.pipeline.list_dlq(Pagination::default()).await.unwrap();
    assert_eq!(page.total, 4);

    let report = h.recovery.purge_dlq(&h.admin).await.unwrap();
    assert_eq!(report.purged, 4);

    assert_eq!(h.pipeline.list_dlq(Pagination::default()).await.unwrap().total, 0);
    for id in ids {
        let detail = h.pipeline.job_detail(id).await.unwrap();
        assert_eq!(detail.job.current_status, JobStatus::DeadLetter);
        assert!(detail.job.archived_at.is_some());
        assert!(h.store.main_entry(id).unwrap().is_none());
        assert!(h.store.dlq_entry(id).unwrap().is_none());

        let last = detail.history.last().unwrap();
        assert_eq!(last.from_status, Some(JobStatus::DeadLetter));
        assert_eq!(last.to_status, JobStatus::DeadLetter);
        assert_eq!(last.performed_by_name, "ops");
    }
}

#[tokio::test]
async fn third_consecutive_failure_dead_letters_directly() {
    let h = harness();
    let id = create(&h, 1, 3).await;

    for attempt in 1..=3u32 {
        let job = lease_and_fail(&h, id).await;
        assert_eq!(job.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(job.current_status, JobStatus::Failed);
            let report = h.pipeline.promote_due(Utc::now()).await.unwrap();
            assert_eq!(report.retried, vec![id]);
        } else {
            assert_eq!(job.current_status, JobStatus::DeadLetter);
        }
    }

    let history = h.store.history(id).await.unwrap();
    let delivery: Vec<_> = transitions(&history)
        .into_iter()
        .skip_while(|(_, to)| *to != JobStatus::Processing)
        .collect();
    use JobStatus::*;
    assert_eq!(
        delivery,
        vec![
            (Some(Queued), Processing),
            (Some(Processing), Failed),
            (Some(Failed), Queued),
            (Some(Queued), Processing),
            (Some(Processing), Failed),
            (Some(Failed), Queued),
            (Some(Queued), Processing),
            (Some(Processing), DeadLetter),
        ]
    );
    assert!(h.store.dlq_entry(id).unwrap().is_some());
}

#[tokio::test]
async fn cancelling_processing_job_is_refused() {
    let h = harness();
    let id = create(&h, 1, 3).await;
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
async fn duplicate_reports_and_acks_are_no_ops() {
    let h = harness();
    let id = create(&h, 1, 3).await;
    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();

    let first = h
        .pipeline
        .report_success(&h.worker, &lease, DeliveryReceipt::new("smtp"))
        .await
        .unwrap();
    assert!(first.is_applied());
    let history_len = h.store.history(id).await.unwrap().len();

    let second = h
        .pipeline
        .report_success(&h.worker, &lease, DeliveryReceipt::new("smtp"))
        .await
        .unwrap();
    assert!(!second.is_applied());
    assert_eq!(second.job().current_status, JobStatus::Sent);
    assert_eq!(h.store.history(id).await.unwrap().len(), history_len);

    assert!(!h.pipeline.ack(lease.msg_id).await.unwrap());
}

#[tokio::test]
async fn expired_lease_is_redelivered_and_late_report_is_idempotent() {
    let h = harness();
    let id = create(&h, 1, 3).await;
    let now = Utc::now();
    let first_worker = Actor::worker("worker-1");
    let second_worker = Actor::worker("worker-2");

    let first = h.pipeline.lease_at(&first_worker, now).await.unwrap().unwrap();
    assert!(h.pipeline.lease_at(&second_worker, now).await.unwrap().is_none());

    let after_timeout = now + Duration::seconds(301);
    let second = h
        .pipeline
        .lease_at(&second_worker, after_timeout)
        .await
        .unwrap()
        .unwrap();
    assert!(second.redelivery);
    assert_eq!(second.msg_id, first.msg_id);
    assert_eq!(second.read_ct, 2);
    assert_eq!(second.job.retry_count, 1);

    h.pipeline
        .report_success(&first_worker, &first, DeliveryReceipt::new("smtp"))
        .await
        .unwrap();
    let late = h
        .pipeline
        .report_success(&second_worker, &second, DeliveryReceipt::new("smtp"))
        .await
        .unwrap();
    assert!(!late.is_applied());
    assert_eq!(
        h.pipeline.job_detail(id).await.unwrap().job.current_status,
        JobStatus::Sent
    );
}

#[tokio::test]
async fn nack_makes_entry_visible_again() {
    let h = harness();
    let id = create(&h, 1, 3).await;
    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    assert!(h.pipeline.lease(&h.worker).await.unwrap().is_none());

    assert!(h.pipeline.nack(lease.msg_id).await.unwrap());
    let again = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    assert_eq!(again.job.id, id);
    assert!(again.redelivery);
}

#[tokio::test]
async fn metrics_snapshot_reflects_queues_and_statuses() {
    let h = harness();
    let processing = create(&h, 1, 3).await;
    let blocked = create(&h, 2, 3).await;
    let dead = create(&h, 3, 1).await;
    let queued = create(&h, 4, 3).await;

    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    assert_eq!(lease.job.id, processing);

    let lease = h.pipeline.lease(&h.worker).await.unwrap().unwrap();
    assert_eq!(lease.job.id, blocked);
    h.pipeline
        .report_failure(
            &h.worker,
            &lease,
            DeliveryFailure::new("account out of credits").with_code("NO_CREDITS"),
        )
        .await
        .unwrap();

    lease_and_fail(&h, dead).await;

    let snapshot = h.pipeline.metrics().await.unwrap();
    assert_eq!(snapshot.main_queue.depth, 2);
    assert_eq!(snapshot.dlq.depth, 1);
    assert!(snapshot.dlq.oldest_age_seconds.is_some());
    assert_eq!(
        snapshot.actionable,
        ActionableCounts {
            processing: 1,
            retryable_failed: 1,
            due_scheduled: 0,
            blocked: 1,
        }
    );

    assert_eq!(snapshot.status_distribution.len(), JobStatus::ALL.len());
    let count = |status| {
        snapshot
            .status_distribution
            .iter()
            .find(|c| c.status == status)
            .map(|c| c.count)
            .unwrap()
    };
    assert_eq!(count(JobStatus::Processing), 1);
    assert_eq!(count(JobStatus::Failed), 1);
    assert_eq!(count(JobStatus::DeadLetter), 1);
    assert_eq!(count(JobStatus::Queued), 1);
    assert_eq!(count(JobStatus::Sent), 0);

    assert_eq!(snapshot.last_24h.len(), 1);
    let row = &snapshot.last_24h[0];
    assert_eq!((row.total, row.failed, row.dead_letter, row.in_flight), (4, 1, 1, 2));

    // the still-queued job is untouched
    let job = h.pipeline.job_detail(queued).await.unwrap().job;
    assert_eq!(job.current_status, JobStatus::Queued);
}

#[tokio::test]
async fn dlq_listing_flags_poison_messages() {
    let store = InMemoryPipelineStore::arc();
    let config = PipelineConfig::default().with_poison_read_threshold(1);
    let pipeline = Pipeline::new(store.clone(), config);
    let worker = Actor::worker("w");
    let id = pipeline
        .create_job(invite(1, 1).with_tenant_name("Acme"))
        .await
        .unwrap()
        .job_id()
        .unwrap();
    let lease = pipeline.lease(&worker).await.unwrap().unwrap();
    pipeline
        .report_failure(&worker, &lease, DeliveryFailure::new("bounced"))
        .await
        .unwrap();

    let page = pipeline.list_dlq(Pagination::default()).await.unwrap();
    let message = &page.items[0];
    assert_eq!(message.jtd_id, id);
    assert_eq!(message.read_ct, 1);
    assert!(message.is_poison);
    assert_eq!(message.tenant_name.as_deref(), Some("Acme"));
    assert_eq!(message.error_message.as_deref(), Some("bounced"));
}

#[tokio::test]
async fn job_listing_filters_by_status() {
    let h = harness();
    create(&h, 1, 3).await;
    let cancelled = create(&h, 2, 3).await;
    h.recovery.cancel(cancelled, &h.admin).await.unwrap();

    let filter = JobFilter {
        status: Some(JobStatus::Cancelled),
        ..JobFilter::default()
    };
    let page = h.pipeline.list_jobs(&filter, Pagination::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, cancelled);
    assert!(!page.has_more);

    let page = h
        .pipeline
        .list_jobs(&JobFilter::default(), Pagination::new(Some(1), None))
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page.has_more);
}

/// Holds every `get_job` at a barrier so two callers read the same snapshot
/// before either writes.
struct LockstepStore {
    inner: Store,
    barrier: Barrier,
}

#[async_trait]
impl PipelineStore for LockstepStore {
    async fn insert_job(
        &self,
        job: &Job,
        history: &[StatusHistoryEntry],
        not_before: DateTime<Utc>,
    ) -> StoreResult<MessageId> {
        self.inner.insert_job(job, history, not_before).await
    }
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let job = self.inner.get_job(id).await;
        self.barrier.wait().await;
        job
    }
    async fn apply(&self, change: JobChange, now: DateTime<Utc>) -> StoreResult<ChangeOutcome> {
        self.inner.apply(change, now).await
    }
    async fn lease(
        &self,
        worker: &Actor,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        self.inner.lease(worker, visibility_timeout, now).await
    }
    async fn ack(&self, msg_id: MessageId) -> StoreResult<bool> {
        self.inner.ack(msg_id).await
    }
    async fn nack(&self, msg_id: MessageId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.nack(msg_id, now).await
    }
    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>> {
        self.inner.due_jobs(now, limit).await
    }
    async fn dlq_message(&self, msg_id: MessageId) -> StoreResult<Option<DlqRecord>> {
        self.inner.dlq_message(msg_id).await
    }
    async fn list_dlq(&self, page: Pagination) -> StoreResult<Page<DlqRecord>> {
        self.inner.list_dlq(page).await
    }
    async fn purge_dlq(&self, actor: &Actor, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        self.inner.purge_dlq(actor, now).await
    }
    async fn list_jobs(&self, filter: &JobFilter, page: Pagination) -> StoreResult<Page<Job>> {
        self.inner.list_jobs(filter, page).await
    }
    async fn history(&self, id: JobId) -> StoreResult<Vec<StatusHistoryEntry>> {
        self.inner.history(id).await
    }
    async fn latest_for_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> StoreResult<Option<Job>> {
        self.inner.latest_for_source(source_type, source_id).await
    }
    async fn mark_delivered(&self, id: JobId, at: DateTime<Utc>) -> StoreResult<Job> {
        self.inner.mark_delivered(id, at).await
    }
    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        self.inner.queue_stats().await
    }
    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, u64)>> {
        self.inner.status_counts().await
    }
    async fn actionable_counts(
        &self,
        now: DateTime<Utc>,
        blocking_codes: &[String],
    ) -> StoreResult<ActionableCounts> {
        self.inner.actionable_counts(now, blocking_codes).await
    }
    async fn breakdown_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<BreakdownRow>> {
        self.inner.breakdown_since(since).await
    }
}

#[tokio::test]
async fn concurrent_force_complete_has_exactly_one_winner() {
    let h = harness();
    let id = create(&h, 1, 3).await;
    h.pipeline.lease(&h.worker).await.unwrap().unwrap();

    let lockstep = Arc::new(LockstepStore {
        inner: h.store.clone(),
        barrier: Barrier::new(2),
    });
    let recovery = Recovery::new(lockstep, h.pipeline.config());
    let alice = AdminActor::named("alice");
    let bob = AdminActor::named("bob");

    let (a, b) = tokio::join!(
        recovery.force_complete(id, ForceOutcome::Sent, &alice),
        recovery.force_complete(id, ForceOutcome::Failed, &bob),
    );

    let (winner, loser) = match (a, b) {
        (Ok(job), Err(e)) | (Err(e), Ok(job)) => (job, e),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert!(matches!(
        loser,
        PipelineError::ConflictingTransition {
            expected: JobStatus::Processing,
            ..
        }
    ));

    let job = h.pipeline.job_detail(id).await.unwrap().job;
    assert_eq!(job.current_status, winner.current_status);
    let overrides = h
        .store
        .history(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.from_status == Some(JobStatus::Processing))
        .count();
    assert_eq!(overrides, 1);
}
