//! Queue metrics rollups for operational dashboards.
//!
//! Everything is computed on demand from the store; there is no materialized
//! state to keep in sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jtd_core::{Channel, JobStatus, PipelineResult};

use crate::config::PipelineConfig;
use crate::store::PipelineStore;

/// Depth of a queue and the enqueue time of its oldest entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub depth: u64,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

impl QueueDepth {
    pub fn summary(&self, now: DateTime<Utc>) -> QueueSummary {
        QueueSummary {
            depth: self.depth,
            oldest_age_seconds: self
                .oldest_enqueued_at
                .map(|at| (now - at).num_seconds().max(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub depth: u64,
    pub oldest_age_seconds: Option<i64>,
}

/// Jobs an operator may need to act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionableCounts {
    pub processing: u64,
    /// `failed` with `retry_count < max_retries`.
    pub retryable_failed: u64,
    /// `scheduled` with `scheduled_at <= now`.
    pub due_scheduled: u64,
    /// In-flight jobs whose `error_code` is a configured blocking code.
    pub blocked: u64,
}

/// Per `(event_type, channel)` counts over a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownRow {
    pub event_type: String,
    pub channel: Channel,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_letter: u64,
    /// created, pending, queued, scheduled or processing.
    pub in_flight: u64,
}

impl BreakdownRow {
    pub fn new(event_type: impl Into<String>, channel: Channel) -> Self {
        Self {
            event_type: event_type.into(),
            channel,
            total: 0,
            sent: 0,
            failed: 0,
            dead_letter: 0,
            in_flight: 0,
        }
    }

    pub fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Sent => self.sent += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::DeadLetter => self.dead_letter += 1,
            JobStatus::Cancelled => {}
            _ => self.in_flight += 1,
        }
    }
}

/// Statuses in which a job can be blocked on an external precondition.
pub fn can_be_blocked(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Created
            | JobStatus::Pending
            | JobStatus::Queued
            | JobStatus::Scheduled
            | JobStatus::Processing
            | JobStatus::Failed
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: u64,
}

/// Point-in-time rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub main_queue: QueueSummary,
    pub dlq: QueueSummary,
    pub actionable: ActionableCounts,
    /// Every status, zero-filled, in lifecycle order.
    pub status_distribution: Vec<StatusCount>,
    pub last_24h: Vec<BreakdownRow>,
}

pub struct QueueMetricsAggregator<S> {
    store: S,
    blocking_error_codes: Vec<String>,
}

impl<S: PipelineStore> QueueMetricsAggregator<S> {
    pub fn new(store: S, config: &PipelineConfig) -> Self {
        Self {
            store,
            blocking_error_codes: config.blocking_error_codes.clone(),
        }
    }

    pub async fn snapshot(&self) -> PipelineResult<QueueMetricsSnapshot> {
        self.snapshot_at(Utc::now()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> PipelineResult<QueueMetricsSnapshot> {
        let queues = self.store.queue_stats().await?;
        let actionable = self
            .store
            .actionable_counts(now, &self.blocking_error_codes)
            .await?;
        let counts = self.store.status_counts().await?;
        let last_24h = self
            .store
            .breakdown_since(now - chrono::Duration::hours(24))
            .await?;

        let status_distribution = JobStatus::ALL
            .into_iter()
            .map(|status| StatusCount {
                status,
                count: counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map_or(0, |(_, c)| *c),
            })
            .collect();

        Ok(QueueMetricsSnapshot {
            sampled_at: now,
            main_queue: queues.main.summary(now),
            dlq: queues.dlq.summary(now),
            actionable,
            status_distribution,
            last_24h,
        })
    }
}

/// Sort breakdown rows busiest first, then by name.
pub(crate) fn sort_breakdown(rows: &mut [BreakdownRow]) {
    rows.sort_by(|a, b| {
        b.total
            .cmp(&a.total)
            .then_with(|| a.event_type.cmp(&b.event_type))
            .then_with(|| a.channel.cmp(&b.channel))
    });
}
