//! Postgres-backed pipeline store.
//!
//! Every mutation runs in one transaction: lock the job row, apply the same
//! pure transition logic the in-memory backend uses, write the row back,
//! append history, apply the queue effect, commit.
//!
//! ## Locking
//!
//! Mutations lock the job row first and queue rows second. `lease` starts
//! from the queue, so it takes both locks with `SKIP LOCKED` and simply moves
//! on when a job is busy; it never waits on a lock held by a mutation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Storage` (duplicate row) |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Storage` (retryable) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use jtd_core::delivery::{self, LeaseStep};
use jtd_core::{
    Actor, ActorKind, Channel, HistoryId, Job, JobId, JobStatus, MessageId, RecipientData,
    StatusHistoryEntry, TenantChannelConfig, TenantId,
};

use super::{
    ChangeOutcome, DlqEntry, DlqRecord, JobChange, JobFilter, Lease, LeaseOutcome, Page,
    PURGE_REASON, Pagination, PipelineStore, QueueEffect, QueueStats, StoreError, StoreResult,
    TenantConfigStore,
};
use crate::metrics::{self, ActionableCounts, BreakdownRow, QueueDepth};

const MIGRATION: &str = include_str!("../../migrations/0001_jtd_pipeline.sql");

/// Postgres pipeline store.
#[derive(Debug, Clone)]
pub struct PostgresPipelineStore {
    pool: Arc<PgPool>,
}

impl PostgresPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a default pool.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> StoreResult<()> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    id: JobId,
) -> StoreResult<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jtd_jobs WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.map(|r| job_from_row(&r)).transpose()
}

async fn insert_job_row(tx: &mut Transaction<'static, Postgres>, job: &Job) -> StoreResult<()> {
    let recipient = serde_json::to_value(&job.recipient_data)
        .map_err(|e| StoreError::Storage(format!("failed to encode recipient_data: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO jtd_jobs (
            id, event_type, channel, tenant_id, tenant_name, source_type, source_id,
            current_status, priority, recipient_data, template_data, metadata,
            retry_count, max_retries, cost, provider_code, error_message, error_code,
            scheduled_at, executed_at, completed_at, created_at, sent_at, delivered_at,
            next_retry_at, archived_at, status_changed_at, updated_at,
            is_live, is_active, performed_by_type, performed_by_name
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7,
            $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23, $24,
            $25, $26, $27, $28,
            $29, $30, $31, $32
        )
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(&job.event_type)
    .bind(job.channel.as_str())
    .bind(job.tenant_id.as_uuid())
    .bind(&job.tenant_name)
    .bind(&job.source_type)
    .bind(&job.source_id)
    .bind(job.current_status.as_str())
    .bind(job.priority)
    .bind(&recipient)
    .bind(&job.template_data)
    .bind(&job.metadata)
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(job.cost)
    .bind(&job.provider_code)
    .bind(&job.error_message)
    .bind(&job.error_code)
    .bind(job.scheduled_at)
    .bind(job.executed_at)
    .bind(job.completed_at)
    .bind(job.created_at)
    .bind(job.sent_at)
    .bind(job.delivered_at)
    .bind(job.next_retry_at)
    .bind(job.archived_at)
    .bind(job.status_changed_at)
    .bind(job.updated_at)
    .bind(job.is_live)
    .bind(job.is_active)
    .bind(job.performed_by.kind.as_str())
    .bind(&job.performed_by.name)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Storage(format!("job already exists: {}", job.id))
        } else {
            map_sqlx_error("insert_job", e)
        }
    })?;
    Ok(())
}

/// Write back the mutable columns of a locked job.
async fn write_job(tx: &mut Transaction<'static, Postgres>, job: &Job) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE jtd_jobs SET
            current_status = $2,
            retry_count = $3,
            cost = $4,
            provider_code = $5,
            error_message = $6,
            error_code = $7,
            executed_at = $8,
            completed_at = $9,
            sent_at = $10,
            delivered_at = $11,
            next_retry_at = $12,
            archived_at = $13,
            status_changed_at = $14,
            updated_at = $15,
            is_active = $16,
            performed_by_type = $17,
            performed_by_name = $18
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.current_status.as_str())
    .bind(job.retry_count as i32)
    .bind(job.cost)
    .bind(&job.provider_code)
    .bind(&job.error_message)
    .bind(&job.error_code)
    .bind(job.executed_at)
    .bind(job.completed_at)
    .bind(job.sent_at)
    .bind(job.delivered_at)
    .bind(job.next_retry_at)
    .bind(job.archived_at)
    .bind(job.status_changed_at)
    .bind(job.updated_at)
    .bind(job.is_active)
    .bind(job.performed_by.kind.as_str())
    .bind(&job.performed_by.name)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'static, Postgres>,
    entry: &StatusHistoryEntry,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO jtd_status_history (
            id, jtd_id, from_status, to_status, duration_seconds,
            performed_by_type, performed_by_name, reason, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.jtd_id.as_uuid())
    .bind(entry.from_status.map(|s| s.as_str()))
    .bind(entry.to_status.as_str())
    .bind(entry.duration_seconds)
    .bind(entry.performed_by_type.as_str())
    .bind(&entry.performed_by_name)
    .bind(&entry.reason)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

async fn enqueue(
    tx: &mut Transaction<'static, Postgres>,
    jtd_id: JobId,
    priority: i32,
    not_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StoreResult<MessageId> {
    sqlx::query("DELETE FROM jtd_dlq WHERE jtd_id = $1")
        .bind(jtd_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_clear_dlq", e))?;

    let row = sqlx::query(
        r#"
        INSERT INTO jtd_main_queue (jtd_id, priority, sort_at, visible_at, enqueued_at)
        VALUES ($1, $2, $3, $3, $4)
        ON CONFLICT (jtd_id) DO UPDATE SET
            priority = EXCLUDED.priority,
            sort_at = EXCLUDED.sort_at,
            visible_at = EXCLUDED.visible_at,
            leased_by = NULL
        RETURNING msg_id
        "#,
    )
    .bind(jtd_id.as_uuid())
    .bind(priority)
    .bind(not_before)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("enqueue", e))?;

    let msg_id: i64 = row
        .try_get("msg_id")
        .map_err(|e| map_sqlx_error("enqueue", e))?;
    Ok(MessageId::new(msg_id))
}

async fn apply_effect(
    tx: &mut Transaction<'static, Postgres>,
    jtd_id: JobId,
    effect: QueueEffect,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    match effect {
        QueueEffect::None => {}
        QueueEffect::Enqueue {
            priority,
            not_before,
        } => {
            enqueue(tx, jtd_id, priority, not_before, now).await?;
        }
        QueueEffect::Remove => {
            sqlx::query("DELETE FROM jtd_main_queue WHERE jtd_id = $1")
                .bind(jtd_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("dequeue", e))?;
        }
        QueueEffect::DeadLetter => {
            sqlx::query(
                r#"
                WITH moved AS (
                    DELETE FROM jtd_main_queue WHERE jtd_id = $1 RETURNING read_ct
                )
                INSERT INTO jtd_dlq (jtd_id, read_ct, enqueued_at)
                VALUES ($1, COALESCE((SELECT read_ct FROM moved), 0), $2)
                ON CONFLICT (jtd_id) DO NOTHING
                "#,
            )
            .bind(jtd_id.as_uuid())
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;
        }
    }
    Ok(())
}

#[async_trait]
impl PipelineStore for PostgresPipelineStore {
    #[instrument(skip(self, job, history), fields(job_id = %job.id), err)]
    async fn insert_job(
        &self,
        job: &Job,
        history: &[StatusHistoryEntry],
        not_before: DateTime<Utc>,
    ) -> StoreResult<MessageId> {
        let mut tx = self.begin().await?;
        insert_job_row(&mut tx, job).await?;
        for entry in history {
            insert_history(&mut tx, entry).await?;
        }
        let msg_id = enqueue(&mut tx, job.id, job.priority, not_before, job.created_at).await?;
        commit(tx).await?;
        Ok(msg_id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jtd_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(
        skip(self, change),
        fields(job_id = %change.job_id, expected = %change.expected, actor = %change.actor),
        err
    )]
    async fn apply(&self, change: JobChange, now: DateTime<Utc>) -> StoreResult<ChangeOutcome> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, change.job_id)
            .await?
            .ok_or(StoreError::NotFound(change.job_id))?;

        if !change.precondition(&job)? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(ChangeOutcome::Unchanged { job });
        }

        let (entry, effect) = change.apply_to(&mut job, now)?;
        write_job(&mut tx, &job).await?;
        insert_history(&mut tx, &entry).await?;
        apply_effect(&mut tx, job.id, effect, now).await?;
        commit(tx).await?;

        Ok(ChangeOutcome::Applied { job, entry })
    }

    #[instrument(skip(self, worker), fields(worker = %worker.name), err)]
    async fn lease(
        &self,
        worker: &Actor,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let mut tx = self.begin().await?;
        let mut outcome = LeaseOutcome::default();
        let mut busy: Vec<i64> = Vec::new();

        loop {
            let Some(row) = sqlx::query(
                r#"
                SELECT msg_id, jtd_id
                FROM jtd_main_queue
                WHERE visible_at <= $1 AND NOT (msg_id = ANY($2))
                ORDER BY priority, sort_at, msg_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(now)
            .bind(&busy)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lease_select", e))?
            else {
                break;
            };

            let raw_msg_id: i64 = row
                .try_get("msg_id")
                .map_err(|e| map_sqlx_error("lease_select", e))?;
            let jtd_uuid: uuid::Uuid = row
                .try_get("jtd_id")
                .map_err(|e| map_sqlx_error("lease_select", e))?;
            let msg_id = MessageId::new(raw_msg_id);
            let jtd_id = JobId::from_uuid(jtd_uuid);

            let locked = sqlx::query("SELECT * FROM jtd_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED")
                .bind(jtd_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lease_lock_job", e))?;

            let mut job = match locked {
                Some(row) => job_from_row(&row)?,
                None => {
                    let exists = sqlx::query("SELECT 1 FROM jtd_jobs WHERE id = $1")
                        .bind(jtd_id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("lease_job_exists", e))?
                        .is_some();
                    if exists {
                        // a mutation holds the job; try the next entry
                        busy.push(raw_msg_id);
                    } else {
                        delete_main_entry(&mut tx, msg_id).await?;
                        outcome.orphaned.push(msg_id);
                    }
                    continue;
                }
            };

            if !job.is_active {
                delete_main_entry(&mut tx, msg_id).await?;
                outcome.orphaned.push(msg_id);
                continue;
            }

            let step = delivery::begin_delivery(&mut job, worker, now)?;
            let redelivery = matches!(step, LeaseStep::Redeliver);
            match step {
                LeaseStep::Deliver(entries) => {
                    for entry in &entries {
                        insert_history(&mut tx, entry).await?;
                    }
                }
                LeaseStep::Redeliver => {}
                LeaseStep::Exhausted(entry) => {
                    sqlx::query("UPDATE jtd_main_queue SET read_ct = read_ct + 1 WHERE msg_id = $1")
                        .bind(raw_msg_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("lease_count_read", e))?;
                    write_job(&mut tx, &job).await?;
                    insert_history(&mut tx, &entry).await?;
                    apply_effect(&mut tx, jtd_id, QueueEffect::DeadLetter, now).await?;
                    outcome.exhausted.push(jtd_id);
                    continue;
                }
                LeaseStep::Orphan => {
                    delete_main_entry(&mut tx, msg_id).await?;
                    outcome.orphaned.push(msg_id);
                    continue;
                }
            }

            write_job(&mut tx, &job).await?;
            let visible_until = delivery::offset_saturating(now, visibility_timeout);
            let row = sqlx::query(
                r#"
                UPDATE jtd_main_queue
                SET read_ct = read_ct + 1, visible_at = $2, leased_by = $3
                WHERE msg_id = $1
                RETURNING read_ct
                "#,
            )
            .bind(raw_msg_id)
            .bind(visible_until)
            .bind(&worker.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lease_update", e))?;
            let read_ct: i32 = row
                .try_get("read_ct")
                .map_err(|e| map_sqlx_error("lease_update", e))?;

            outcome.lease = Some(Lease {
                msg_id,
                job,
                read_ct: read_ct.max(0) as u32,
                visible_until,
                redelivery,
            });
            break;
        }

        commit(tx).await?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(msg_id = %msg_id), err)]
    async fn ack(&self, msg_id: MessageId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM jtd_main_queue WHERE msg_id = $1")
            .bind(msg_id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ack", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(msg_id = %msg_id), err)]
    async fn nack(&self, msg_id: MessageId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jtd_main_queue SET visible_at = $2, leased_by = NULL WHERE msg_id = $1",
        )
        .bind(msg_id.get())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("nack", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jtd_jobs
            WHERE is_active
              AND (
                (current_status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= $1))
                OR (current_status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= $1))
              )
            ORDER BY priority, status_changed_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(msg_id = %msg_id), err)]
    async fn dlq_message(&self, msg_id: MessageId) -> StoreResult<Option<DlqRecord>> {
        let row = sqlx::query(
            r#"
            SELECT d.msg_id AS dlq_msg_id, d.read_ct AS dlq_read_ct,
                   d.enqueued_at AS dlq_enqueued_at, j.*
            FROM jtd_dlq d
            JOIN jtd_jobs j ON j.id = d.jtd_id
            WHERE d.msg_id = $1
            "#,
        )
        .bind(msg_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_message", e))?;
        row.map(|r| dlq_record_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dlq(&self, page: Pagination) -> StoreResult<Page<DlqRecord>> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM jtd_dlq")
            .fetch_one(&*self.pool)
            .await
            .and_then(|r| r.try_get("total"))
            .map_err(|e| map_sqlx_error("count_dlq", e))?;

        let rows = sqlx::query(
            r#"
            SELECT d.msg_id AS dlq_msg_id, d.read_ct AS dlq_read_ct,
                   d.enqueued_at AS dlq_enqueued_at, j.*
            FROM jtd_dlq d
            JOIN jtd_jobs j ON j.id = d.jtd_id
            ORDER BY d.enqueued_at, d.msg_id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dlq", e))?;

        let items = rows
            .iter()
            .map(dlq_record_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self, actor), fields(actor = %actor), err)]
    async fn purge_dlq(&self, actor: &Actor, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let mut tx = self.begin().await?;

        // job rows before queue rows, the same order `apply` takes them in
        let locked: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jtd_jobs
            WHERE id IN (SELECT jtd_id FROM jtd_dlq)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_lock_jobs", e))?;

        let rows = sqlx::query(
            r#"
            SELECT d.msg_id AS dlq_msg_id, d.read_ct AS dlq_read_ct,
                   d.enqueued_at AS dlq_enqueued_at, j.*
            FROM jtd_dlq d
            JOIN jtd_jobs j ON j.id = d.jtd_id
            WHERE d.jtd_id = ANY($1)
            ORDER BY d.msg_id
            FOR UPDATE OF d
            "#,
        )
        .bind(&locked)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_lock_dlq", e))?;

        let mut msg_ids = Vec::with_capacity(rows.len());
        let mut purged = Vec::with_capacity(rows.len());
        for row in &rows {
            let DlqRecord { entry, mut job } = dlq_record_from_row(row)?;
            let history = job.archive(actor, PURGE_REASON, now)?;
            write_job(&mut tx, &job).await?;
            insert_history(&mut tx, &history).await?;
            msg_ids.push(entry.msg_id.get());
            purged.push(job.id);
        }

        sqlx::query("DELETE FROM jtd_dlq WHERE msg_id = ANY($1)")
            .bind(&msg_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_delete", e))?;

        commit(tx).await?;
        Ok(purged)
    }

    #[instrument(skip(self, filter), err)]
    async fn list_jobs(&self, filter: &JobFilter, page: Pagination) -> StoreResult<Page<Job>> {
        let status = filter.status.map(|s| s.as_str());
        let tenant = filter.tenant_id.map(|t| *t.as_uuid());
        let event_type = filter.event_type.as_deref();
        let channel = filter.channel.map(|c| c.as_str());

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM jtd_jobs
            WHERE is_active
              AND ($1::text IS NULL OR current_status = $1)
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::text IS NULL OR channel = $4)
            "#,
        )
        .bind(status)
        .bind(tenant)
        .bind(event_type)
        .bind(channel)
        .fetch_one(&*self.pool)
        .await
        .and_then(|r| r.try_get("total"))
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jtd_jobs
            WHERE is_active
              AND ($1::text IS NULL OR current_status = $1)
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::text IS NULL OR channel = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(status)
        .bind(tenant)
        .bind(event_type)
        .bind(channel)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows.iter().map(job_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn history(&self, id: JobId) -> StoreResult<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM jtd_status_history WHERE jtd_id = $1 ORDER BY seq",
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw = HistoryRow::from_row(&row).map_err(|e| map_sqlx_error("history", e))?;
            entries.push(raw.try_into()?);
        }
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    async fn latest_for_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> StoreResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jtd_jobs
            WHERE source_type = $1 AND source_id = $2 AND is_active
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(source_type)
        .bind(source_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_for_source", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_delivered(&self, id: JobId, at: DateTime<Utc>) -> StoreResult<Job> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id)
            .await?
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
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        let main = queue_depth(
            &self.pool,
            "SELECT COUNT(*) AS depth, MIN(enqueued_at) AS oldest FROM jtd_main_queue",
        )
        .await?;
        let dlq = queue_depth(
            &self.pool,
            "SELECT COUNT(*) AS depth, MIN(enqueued_at) AS oldest FROM jtd_dlq",
        )
        .await?;
        Ok(QueueStats { main, dlq })
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT current_status, COUNT(*) AS count
            FROM jtd_jobs
            WHERE is_active
            GROUP BY current_status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status_counts", e))?;

        rows.iter()
            .map(|row| {
                let status: String = row
                    .try_get("current_status")
                    .map_err(|e| map_sqlx_error("status_counts", e))?;
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| map_sqlx_error("status_counts", e))?;
                Ok((parse_column(&status, "current_status")?, count.max(0) as u64))
            })
            .collect()
    }

    #[instrument(skip(self, blocking_codes), err)]
    async fn actionable_counts(
        &self,
        now: DateTime<Utc>,
        blocking_codes: &[String],
    ) -> StoreResult<ActionableCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE current_status = 'processing') AS processing,
                COUNT(*) FILTER (
                    WHERE current_status = 'failed' AND retry_count < max_retries
                ) AS retryable_failed,
                COUNT(*) FILTER (
                    WHERE current_status = 'scheduled'
                      AND (scheduled_at IS NULL OR scheduled_at <= $1)
                ) AS due_scheduled,
                COUNT(*) FILTER (
                    WHERE current_status IN
                        ('created', 'pending', 'queued', 'scheduled', 'processing', 'failed')
                      AND error_code = ANY($2)
                ) AS blocked
            FROM jtd_jobs
            WHERE is_active
            "#,
        )
        .bind(now)
        .bind(blocking_codes)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("actionable_counts", e))?;

        let get = |name: &str| -> StoreResult<u64> {
            let v: i64 = row.try_get(name).map_err(|e| map_sqlx_error("actionable_counts", e))?;
            Ok(v.max(0) as u64)
        };
        Ok(ActionableCounts {
            processing: get("processing")?,
            retryable_failed: get("retryable_failed")?,
            due_scheduled: get("due_scheduled")?,
            blocked: get("blocked")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn breakdown_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<BreakdownRow>> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_type,
                channel,
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE current_status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE current_status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE current_status = 'dead_letter') AS dead_letter,
                COUNT(*) FILTER (WHERE current_status IN
                    ('created', 'pending', 'queued', 'scheduled', 'processing')) AS in_flight
            FROM jtd_jobs
            WHERE is_active AND created_at >= $1
            GROUP BY event_type, channel
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("breakdown_since", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw =
                BreakdownSqlRow::from_row(&row).map_err(|e| map_sqlx_error("breakdown_since", e))?;
            out.push(raw.try_into()?);
        }
        metrics::sort_breakdown(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl TenantConfigStore for PostgresPipelineStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn channel_config(
        &self,
        tenant_id: TenantId,
        source_type: &str,
    ) -> StoreResult<Option<TenantChannelConfig>> {
        let row = sqlx::query(
            "SELECT * FROM jtd_tenant_channel_config WHERE tenant_id = $1 AND source_type = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(source_type)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("channel_config", e))?;
        row.map(|r| tenant_config_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn tenant_configs(&self, tenant_id: TenantId) -> StoreResult<Vec<TenantChannelConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM jtd_tenant_channel_config WHERE tenant_id = $1 ORDER BY source_type",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tenant_configs", e))?;
        rows.iter().map(tenant_config_from_row).collect()
    }

    #[instrument(
        skip(self, config),
        fields(tenant_id = %config.tenant_id, source_type = %config.source_type),
        err
    )]
    async fn upsert_channel_config(&self, config: TenantChannelConfig) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jtd_tenant_channel_config (
                tenant_id, source_type, email_enabled, sms_enabled, whatsapp_enabled,
                inapp_enabled, is_live, is_active, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, source_type) DO UPDATE SET
                email_enabled = EXCLUDED.email_enabled,
                sms_enabled = EXCLUDED.sms_enabled,
                whatsapp_enabled = EXCLUDED.whatsapp_enabled,
                inapp_enabled = EXCLUDED.inapp_enabled,
                is_live = EXCLUDED.is_live,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.tenant_id.as_uuid())
        .bind(&config.source_type)
        .bind(config.email_enabled)
        .bind(config.sms_enabled)
        .bind(config.whatsapp_enabled)
        .bind(config.inapp_enabled)
        .bind(config.is_live)
        .bind(config.is_active)
        .bind(config.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_channel_config", e))?;
        Ok(())
    }
}

async fn delete_main_entry(
    tx: &mut Transaction<'static, Postgres>,
    msg_id: MessageId,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM jtd_main_queue WHERE msg_id = $1")
        .bind(msg_id.get())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_main_entry", e))?;
    Ok(())
}

async fn queue_depth(pool: &PgPool, sql: &'static str) -> StoreResult<QueueDepth> {
    let row = sqlx::query(sql)
        .fetch_one(pool)
        .await
        .map_err(|e| map_sqlx_error("queue_depth", e))?;
    let depth: i64 = row
        .try_get("depth")
        .map_err(|e| map_sqlx_error("queue_depth", e))?;
    let oldest: Option<DateTime<Utc>> = row
        .try_get("oldest")
        .map_err(|e| map_sqlx_error("queue_depth", e))?;
    Ok(QueueDepth {
        depth: depth.max(0) as u64,
        oldest_enqueued_at: oldest,
    })
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Storage(format!("duplicate row: {msg}")),
                Some("40001") | Some("40P01") => {
                    StoreError::Storage(format!("transaction aborted, retry: {msg}"))
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        other => StoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn parse_column<T>(value: &str, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Storage(format!("corrupt {column} value '{value}': {e}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    event_type: String,
    channel: String,
    tenant_id: uuid::Uuid,
    tenant_name: Option<String>,
    source_type: String,
    source_id: String,
    current_status: String,
    priority: i32,
    recipient_data: serde_json::Value,
    template_data: serde_json::Value,
    metadata: serde_json::Value,
    retry_count: i32,
    max_retries: i32,
    cost: Option<f64>,
    provider_code: Option<String>,
    error_message: Option<String>,
    error_code: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
    status_changed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_live: bool,
    is_active: bool,
    performed_by_type: String,
    performed_by_name: String,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            channel: row.try_get("channel")?,
            tenant_id: row.try_get("tenant_id")?,
            tenant_name: row.try_get("tenant_name")?,
            source_type: row.try_get("source_type")?,
            source_id: row.try_get("source_id")?,
            current_status: row.try_get("current_status")?,
            priority: row.try_get("priority")?,
            recipient_data: row.try_get("recipient_data")?,
            template_data: row.try_get("template_data")?,
            metadata: row.try_get("metadata")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            cost: row.try_get("cost")?,
            provider_code: row.try_get("provider_code")?,
            error_message: row.try_get("error_message")?,
            error_code: row.try_get("error_code")?,
            scheduled_at: row.try_get("scheduled_at")?,
            executed_at: row.try_get("executed_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            archived_at: row.try_get("archived_at")?,
            status_changed_at: row.try_get("status_changed_at")?,
            updated_at: row.try_get("updated_at")?,
            is_live: row.try_get("is_live")?,
            is_active: row.try_get("is_active")?,
            performed_by_type: row.try_get("performed_by_type")?,
            performed_by_name: row.try_get("performed_by_name")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let recipient_data: RecipientData = serde_json::from_value(row.recipient_data)
            .map_err(|e| StoreError::Storage(format!("corrupt recipient_data: {e}")))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            event_type: row.event_type,
            channel: parse_column::<Channel>(&row.channel, "channel")?,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            tenant_name: row.tenant_name,
            source_type: row.source_type,
            source_id: row.source_id,
            current_status: parse_column(&row.current_status, "current_status")?,
            priority: row.priority,
            recipient_data,
            template_data: row.template_data,
            metadata: row.metadata,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            cost: row.cost,
            provider_code: row.provider_code,
            error_message: row.error_message,
            error_code: row.error_code,
            scheduled_at: row.scheduled_at,
            executed_at: row.executed_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            next_retry_at: row.next_retry_at,
            archived_at: row.archived_at,
            status_changed_at: row.status_changed_at,
            updated_at: row.updated_at,
            is_live: row.is_live,
            is_active: row.is_active,
            performed_by: Actor {
                kind: parse_column::<ActorKind>(&row.performed_by_type, "performed_by_type")?,
                name: row.performed_by_name,
            },
        })
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

fn dlq_record_from_row(row: &PgRow) -> StoreResult<DlqRecord> {
    let job = job_from_row(row)?;
    let msg_id: i64 = row.try_get("dlq_msg_id").map_err(|e| map_sqlx_error("decode_dlq", e))?;
    let read_ct: i32 = row.try_get("dlq_read_ct").map_err(|e| map_sqlx_error("decode_dlq", e))?;
    let enqueued_at: DateTime<Utc> = row
        .try_get("dlq_enqueued_at")
        .map_err(|e| map_sqlx_error("decode_dlq", e))?;
    Ok(DlqRecord {
        entry: DlqEntry {
            msg_id: MessageId::new(msg_id),
            jtd_id: job.id,
            read_ct: read_ct.max(0) as u32,
            enqueued_at,
        },
        job,
    })
}

#[derive(Debug)]
struct HistoryRow {
    id: uuid::Uuid,
    jtd_id: uuid::Uuid,
    from_status: Option<String>,
    to_status: String,
    duration_seconds: i64,
    performed_by_type: String,
    performed_by_name: String,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for HistoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            id: row.try_get("id")?,
            jtd_id: row.try_get("jtd_id")?,
            from_status: row.try_get("from_status")?,
            to_status: row.try_get("to_status")?,
            duration_seconds: row.try_get("duration_seconds")?,
            performed_by_type: row.try_get("performed_by_type")?,
            performed_by_name: row.try_get("performed_by_name")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<HistoryRow> for StatusHistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let from_status = row
            .from_status
            .as_deref()
            .map(|s| parse_column::<JobStatus>(s, "from_status"))
            .transpose()?;
        Ok(StatusHistoryEntry {
            id: HistoryId::from_uuid(row.id),
            jtd_id: JobId::from_uuid(row.jtd_id),
            from_status,
            to_status: parse_column(&row.to_status, "to_status")?,
            duration_seconds: row.duration_seconds,
            performed_by_type: parse_column(&row.performed_by_type, "performed_by_type")?,
            performed_by_name: row.performed_by_name,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct BreakdownSqlRow {
    event_type: String,
    channel: String,
    total: i64,
    sent: i64,
    failed: i64,
    dead_letter: i64,
    in_flight: i64,
}

impl<'r> FromRow<'r, PgRow> for BreakdownSqlRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BreakdownSqlRow {
            event_type: row.try_get("event_type")?,
            channel: row.try_get("channel")?,
            total: row.try_get("total")?,
            sent: row.try_get("sent")?,
            failed: row.try_get("failed")?,
            dead_letter: row.try_get("dead_letter")?,
            in_flight: row.try_get("in_flight")?,
        })
    }
}

impl TryFrom<BreakdownSqlRow> for BreakdownRow {
    type Error = StoreError;

    fn try_from(row: BreakdownSqlRow) -> Result<Self, Self::Error> {
        Ok(BreakdownRow {
            event_type: row.event_type,
            channel: parse_column(&row.channel, "channel")?,
            total: row.total.max(0) as u64,
            sent: row.sent.max(0) as u64,
            failed: row.failed.max(0) as u64,
            dead_letter: row.dead_letter.max(0) as u64,
            in_flight: row.in_flight.max(0) as u64,
        })
    }
}

fn tenant_config_from_row(row: &PgRow) -> StoreResult<TenantChannelConfig> {
    let decode = |e| map_sqlx_error("decode_tenant_config", e);
    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(decode)?;
    Ok(TenantChannelConfig {
        tenant_id: TenantId::from_uuid(tenant_id),
        source_type: row.try_get("source_type").map_err(decode)?,
        email_enabled: row.try_get("email_enabled").map_err(decode)?,
        sms_enabled: row.try_get("sms_enabled").map_err(decode)?,
        whatsapp_enabled: row.try_get("whatsapp_enabled").map_err(decode)?,
        inapp_enabled: row.try_get("inapp_enabled").map_err(decode)?,
        is_live: row.try_get("is_live").map_err(decode)?,
        is_active: row.try_get("is_active").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}
