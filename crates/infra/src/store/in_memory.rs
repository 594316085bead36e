//! In-memory backend for tests and local development.
//!
//! One mutex guards jobs, history and both queues, so every trait method is
//! a single atomic step.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jtd_core::delivery::{self, LeaseStep};
use jtd_core::{
    Actor, Job, JobId, JobStatus, MessageId, StatusHistoryEntry, TenantChannelConfig, TenantId,
};

use super::{
    ChangeOutcome, DlqEntry, DlqRecord, JobChange, JobFilter, Lease, LeaseOutcome, Page,
    PURGE_REASON, Pagination, PipelineStore, QueueEffect, QueueEntry, QueueStats, StoreError,
    StoreResult, TenantConfigStore,
};
use crate::metrics::{self, ActionableCounts, BreakdownRow, QueueDepth};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    history: Vec<StatusHistoryEntry>,
    main: BTreeMap<MessageId, QueueEntry>,
    main_by_job: HashMap<JobId, MessageId>,
    dlq: BTreeMap<MessageId, DlqEntry>,
    dlq_by_job: HashMap<JobId, MessageId>,
    last_msg_id: i64,
    tenant_configs: HashMap<(TenantId, String), TenantChannelConfig>,
}

impl State {
    fn next_msg_id(&mut self) -> MessageId {
        self.last_msg_id += 1;
        MessageId::new(self.last_msg_id)
    }

    fn remove_main(&mut self, jtd_id: JobId) -> Option<QueueEntry> {
        let msg_id = self.main_by_job.remove(&jtd_id)?;
        self.main.remove(&msg_id)
    }

    fn remove_dlq(&mut self, jtd_id: JobId) -> Option<DlqEntry> {
        let msg_id = self.dlq_by_job.remove(&jtd_id)?;
        self.dlq.remove(&msg_id)
    }

    fn enqueue(
        &mut self,
        jtd_id: JobId,
        priority: i32,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MessageId {
        self.remove_dlq(jtd_id);

        if let Some(msg_id) = self.main_by_job.get(&jtd_id).copied() {
            if let Some(entry) = self.main.get_mut(&msg_id) {
                entry.priority = priority;
                entry.sort_at = not_before;
                entry.visible_at = not_before;
                entry.leased_by = None;
                return msg_id;
            }
        }

        let msg_id = self.next_msg_id();
        self.main.insert(
            msg_id,
            QueueEntry {
                msg_id,
                jtd_id,
                priority,
                sort_at: not_before,
                visible_at: not_before,
                enqueued_at: now,
                read_ct: 0,
                leased_by: None,
            },
        );
        self.main_by_job.insert(jtd_id, msg_id);
        msg_id
    }

    fn dead_letter(&mut self, jtd_id: JobId, now: DateTime<Utc>) {
        let read_ct = self.remove_main(jtd_id).map_or(0, |e| e.read_ct);
        if self.dlq_by_job.contains_key(&jtd_id) {
            return;
        }
        let msg_id = self.next_msg_id();
        self.dlq.insert(
            msg_id,
            DlqEntry {
                msg_id,
                jtd_id,
                read_ct,
                enqueued_at: now,
            },
        );
        self.dlq_by_job.insert(jtd_id, msg_id);
    }

    fn apply_effect(&mut self, jtd_id: JobId, effect: QueueEffect, now: DateTime<Utc>) {
        match effect {
            QueueEffect::None => {}
            QueueEffect::Enqueue {
                priority,
                not_before,
            } => {
                self.enqueue(jtd_id, priority, not_before, now);
            }
            QueueEffect::Remove => {
                self.remove_main(jtd_id);
            }
            QueueEffect::DeadLetter => self.dead_letter(jtd_id, now),
        }
    }

    fn next_visible(&self, now: DateTime<Utc>) -> Option<MessageId> {
        self.main
            .values()
            .filter(|e| e.is_visible(now))
            .min_by_key(|e| e.order_key())
            .map(|e| e.msg_id)
    }

    fn dlq_record(&self, entry: &DlqEntry) -> StoreResult<DlqRecord> {
        let job = self.jobs.get(&entry.jtd_id).cloned().ok_or_else(|| {
            StoreError::Storage(format!("dlq entry {} references missing job", entry.msg_id))
        })?;
        Ok(DlqRecord {
            entry: entry.clone(),
            job,
        })
    }

    fn active_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|j| j.is_active)
    }
}

/// In-memory pipeline store.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    state: Mutex<State>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    /// Snapshot of the main queue entry for a job (test inspection).
    pub fn main_entry(&self, jtd_id: JobId) -> StoreResult<Option<QueueEntry>> {
        let state = self.state()?;
        Ok(state
            .main_by_job
            .get(&jtd_id)
            .and_then(|id| state.main.get(id))
            .cloned())
    }

    /// Snapshot of the DLQ entry for a job (test inspection).
    pub fn dlq_entry(&self, jtd_id: JobId) -> StoreResult<Option<DlqEntry>> {
        let state = self.state()?;
        Ok(state
            .dlq_by_job
            .get(&jtd_id)
            .and_then(|id| state.dlq.get(id))
            .cloned())
    }

    /// Soft-delete a job without touching its queue presence.
    pub fn deactivate(&self, jtd_id: JobId) -> StoreResult<()> {
        let mut state = self.state()?;
        let job = state
            .jobs
            .get_mut(&jtd_id)
            .ok_or(StoreError::NotFound(jtd_id))?;
        job.is_active = false;
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn insert_job(
        &self,
        job: &Job,
        history: &[StatusHistoryEntry],
        not_before: DateTime<Utc>,
    ) -> StoreResult<MessageId> {
        let mut state = self.state()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Storage(format!("job already exists: {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        state.history.extend_from_slice(history);
        Ok(state.enqueue(job.id, job.priority, not_before, job.created_at))
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state()?.jobs.get(&id).cloned())
    }

    async fn apply(&self, change: JobChange, now: DateTime<Utc>) -> StoreResult<ChangeOutcome> {
        let mut state = self.state()?;
        let current = state
            .jobs
            .get(&change.job_id)
            .ok_or(StoreError::NotFound(change.job_id))?;

        if !change.precondition(current)? {
            return Ok(ChangeOutcome::Unchanged {
                job: current.clone(),
            });
        }

        let mut job = current.clone();
        let (entry, effect) = change.apply_to(&mut job, now)?;

        state.jobs.insert(job.id, job.clone());
        state.history.push(entry.clone());
        state.apply_effect(job.id, effect, now);

        Ok(ChangeOutcome::Applied { job, entry })
    }

    async fn lease(
        &self,
        worker: &Actor,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let mut state = self.state()?;
        let mut outcome = LeaseOutcome::default();

        while let Some(msg_id) = state.next_visible(now) {
            let Some(jtd_id) = state.main.get(&msg_id).map(|e| e.jtd_id) else {
                break;
            };
            let current = state.jobs.get(&jtd_id).filter(|j| j.is_active).cloned();
            let Some(mut job) = current else {
                state.remove_main(jtd_id);
                outcome.orphaned.push(msg_id);
                continue;
            };

            let step = delivery::begin_delivery(&mut job, worker, now)?;
            let redelivery = matches!(step, LeaseStep::Redeliver);

            match step {
                LeaseStep::Deliver(entries) => state.history.extend(entries),
                LeaseStep::Redeliver => {}
                LeaseStep::Exhausted(entry) => {
                    state.history.push(entry);
                    if let Some(e) = state.main.get_mut(&msg_id) {
                        e.read_ct += 1;
                    }
                    state.jobs.insert(jtd_id, job);
                    state.dead_letter(jtd_id, now);
                    outcome.exhausted.push(jtd_id);
                    continue;
                }
                LeaseStep::Orphan => {
                    state.remove_main(jtd_id);
                    outcome.orphaned.push(msg_id);
                    continue;
                }
            }

            let visible_until = delivery::offset_saturating(now, visibility_timeout);
            let read_ct = match state.main.get_mut(&msg_id) {
                Some(entry) => {
                    entry.read_ct += 1;
                    entry.visible_at = visible_until;
                    entry.leased_by = Some(worker.name.clone());
                    entry.read_ct
                }
                None => 0,
            };
            state.jobs.insert(jtd_id, job.clone());

            outcome.lease = Some(Lease {
                msg_id,
                job,
                read_ct,
                visible_until,
                redelivery,
            });
            break;
        }

        Ok(outcome)
    }

    async fn ack(&self, msg_id: MessageId) -> StoreResult<bool> {
        let mut state = self.state()?;
        match state.main.remove(&msg_id) {
            Some(entry) => {
                state.main_by_job.remove(&entry.jtd_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn nack(&self, msg_id: MessageId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state()?;
        match state.main.get_mut(&msg_id) {
            Some(entry) => {
                entry.visible_at = now;
                entry.leased_by = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>> {
        let state = self.state()?;
        let mut due: Vec<Job> = state
            .active_jobs()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.priority, j.status_changed_at, j.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn dlq_message(&self, msg_id: MessageId) -> StoreResult<Option<DlqRecord>> {
        let state = self.state()?;
        state
            .dlq
            .get(&msg_id)
            .map(|entry| state.dlq_record(entry))
            .transpose()
    }

    async fn list_dlq(&self, page: Pagination) -> StoreResult<Page<DlqRecord>> {
        let state = self.state()?;
        let mut entries: Vec<&DlqEntry> = state.dlq.values().collect();
        entries.sort_by_key(|e| (e.enqueued_at, e.msg_id));

        let total = entries.len() as u64;
        let items = entries
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|e| state.dlq_record(e))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn purge_dlq(&self, actor: &Actor, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let mut state = self.state()?;

        // stage everything first so a failure leaves the DLQ untouched
        let mut archived = Vec::with_capacity(state.dlq.len());
        for entry in state.dlq.values() {
            let mut job = state
                .jobs
                .get(&entry.jtd_id)
                .cloned()
                .ok_or(StoreError::NotFound(entry.jtd_id))?;
            let history = job.archive(actor, PURGE_REASON, now)?;
            archived.push((job, history));
        }

        let mut purged = Vec::with_capacity(archived.len());
        for (job, history) in archived {
            purged.push(job.id);
            state.jobs.insert(job.id, job);
            state.history.push(history);
        }
        state.dlq.clear();
        state.dlq_by_job.clear();

        Ok(purged)
    }

    async fn list_jobs(&self, filter: &JobFilter, page: Pagination) -> StoreResult<Page<Job>> {
        let state = self.state()?;
        let mut jobs: Vec<&Job> = state.jobs.values().filter(|j| filter.matches(j)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = jobs.len() as u64;
        let items = jobs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn history(&self, id: JobId) -> StoreResult<Vec<StatusHistoryEntry>> {
        let state = self.state()?;
        Ok(state
            .history
            .iter()
            .filter(|h| h.jtd_id == id)
            .cloned()
            .collect())
    }

    async fn latest_for_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> StoreResult<Option<Job>> {
        let state = self.state()?;
        Ok(state
            .active_jobs()
            .filter(|j| j.source_type == source_type && j.source_id == source_id)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn mark_delivered(&self, id: JobId, at: DateTime<Utc>) -> StoreResult<Job> {
        let mut state = self.state()?;
        let job = state
            .jobs
            .get_mut(&id)
            .filter(|j| j.is_active)
            .ok_or(StoreError::NotFound(id))?;
        if job.current_status != JobStatus::Sent {
            return Err(StoreError::Conflict {
                expected: JobStatus::Sent,
                actual: job.current_status,
            });
        }
        job.delivered_at = Some(at);
        job.updated_at = at;
        Ok(job.clone())
    }

    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        let state = self.state()?;
        Ok(QueueStats {
            main: QueueDepth {
                depth: state.main.len() as u64,
                oldest_enqueued_at: state.main.values().map(|e| e.enqueued_at).min(),
            },
            dlq: QueueDepth {
                depth: state.dlq.len() as u64,
                oldest_enqueued_at: state.dlq.values().map(|e| e.enqueued_at).min(),
            },
        })
    }

    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, u64)>> {
        let state = self.state()?;
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for job in state.active_jobs() {
            *counts.entry(job.current_status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn actionable_counts(
        &self,
        now: DateTime<Utc>,
        blocking_codes: &[String],
    ) -> StoreResult<ActionableCounts> {
        let state = self.state()?;
        let mut counts = ActionableCounts::default();
        for job in state.active_jobs() {
            match job.current_status {
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Failed if job.is_retryable() => counts.retryable_failed += 1,
                JobStatus::Scheduled if job.is_due(now) => counts.due_scheduled += 1,
                _ => {}
            }
            let blocked = metrics::can_be_blocked(job.current_status)
                && job
                    .error_code
                    .as_ref()
                    .is_some_and(|code| blocking_codes.contains(code));
            if blocked {
                counts.blocked += 1;
            }
        }
        Ok(counts)
    }

    async fn breakdown_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<BreakdownRow>> {
        let state = self.state()?;
        let mut rows: HashMap<(String, jtd_core::Channel), BreakdownRow> = HashMap::new();
        for job in state.active_jobs().filter(|j| j.created_at >= since) {
            rows.entry((job.event_type.clone(), job.channel))
                .or_insert_with(|| BreakdownRow::new(job.event_type.clone(), job.channel))
                .count(job.current_status);
        }
        let mut rows: Vec<BreakdownRow> = rows.into_values().collect();
        metrics::sort_breakdown(&mut rows);
        Ok(rows)
    }
}

#[async_trait]
impl TenantConfigStore for InMemoryPipelineStore {
    async fn channel_config(
        &self,
        tenant_id: TenantId,
        source_type: &str,
    ) -> StoreResult<Option<TenantChannelConfig>> {
        let state = self.state()?;
        Ok(state
            .tenant_configs
            .get(&(tenant_id, source_type.to_string()))
            .cloned())
    }

    async fn tenant_configs(&self, tenant_id: TenantId) -> StoreResult<Vec<TenantChannelConfig>> {
        let state = self.state()?;
        let mut configs: Vec<TenantChannelConfig> = state
            .tenant_configs
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.source_type.cmp(&b.source_type));
        Ok(configs)
    }

    async fn upsert_channel_config(&self, config: TenantChannelConfig) -> StoreResult<()> {
        let mut state = self.state()?;
        state
            .tenant_configs
            .insert((config.tenant_id, config.source_type.clone()), config);
        Ok(())
    }
}
