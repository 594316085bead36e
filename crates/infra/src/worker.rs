//! Reference delivery worker.
//!
//! Polls the main queue, hands leased jobs to a channel provider and reports
//! the outcome. Any number of workers may run against the same store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jtd_core::delivery::{DeliveryFailure, DeliveryReceipt};
use jtd_core::{Actor, Channel, Job, JobId, JobStatus, PipelineError, PipelineResult};

use crate::pipeline::Pipeline;
use crate::store::{PipelineStore, TenantConfigStore};

pub const ERROR_NO_PROVIDER: &str = "NO_PROVIDER";

/// Sends a notification through one transport.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, job: &Job) -> Result<DeliveryReceipt, DeliveryFailure>;
}

/// Records the attempt and reports success. Used for test-mode tenants.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyProvider;

pub const LOG_ONLY_PROVIDER_CODE: &str = "test";

#[async_trait]
impl DeliveryProvider for LogOnlyProvider {
    fn name(&self) -> &str {
        "log-only"
    }

    async fn deliver(&self, job: &Job) -> Result<DeliveryReceipt, DeliveryFailure> {
        info!(
            job_id = %job.id,
            channel = %job.channel,
            event_type = %job.event_type,
            tenant_id = %job.tenant_id,
            "test mode delivery; notification not sent"
        );
        Ok(DeliveryReceipt::new(LOG_ONLY_PROVIDER_CODE))
    }
}

/// Channel to provider routing.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    test_mode: Arc<dyn DeliveryProvider>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// No live providers; test-mode jobs still go to [`LogOnlyProvider`].
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            test_mode: Arc::new(LogOnlyProvider),
        }
    }

    /// Every channel, live or not, goes to [`LogOnlyProvider`].
    pub fn log_only() -> Self {
        let mut registry = Self::new();
        for channel in Channel::ALL {
            registry = registry.with_provider(channel, LogOnlyProvider);
        }
        registry
    }

    pub fn with_provider(
        mut self,
        channel: Channel,
        provider: impl DeliveryProvider + 'static,
    ) -> Self {
        self.providers.insert(channel, Arc::new(provider));
        self
    }

    /// Test-mode jobs always resolve to the log-only provider.
    pub fn resolve(&self, job: &Job) -> Option<Arc<dyn DeliveryProvider>> {
        if !job.is_live {
            return Some(self.test_mode.clone());
        }
        self.providers.get(&job.channel).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name, recorded on leases and history entries.
    pub name: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "jtd-worker".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    /// Nothing was visible.
    Idle,
    Sent(JobId),
    Failed(JobId),
    DeadLettered(JobId),
    /// The job changed under the lease (admin override or redelivery to
    /// another worker); the report was dropped.
    LeaseLost(JobId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub leased: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub idle_polls: u64,
}

impl WorkerStats {
    fn record(&mut self, step: &WorkerStep) {
        match step {
            WorkerStep::Idle => self.idle_polls += 1,
            WorkerStep::Sent(_) => {
                self.leased += 1;
                self.sent += 1;
            }
            WorkerStep::Failed(_) => {
                self.leased += 1;
                self.failed += 1;
            }
            WorkerStep::DeadLettered(_) => {
                self.leased += 1;
                self.dead_lettered += 1;
            }
            WorkerStep::LeaseLost(_) => self.leased += 1,
        }
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: watch::Receiver<WorkerStats>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.borrow().clone()
    }

    /// Stop after the current step and wait for the task to finish.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task ended abnormally");
        }
        self.stats.borrow().clone()
    }
}

pub struct Worker<S> {
    pipeline: Pipeline<S>,
    providers: ProviderRegistry,
    actor: Actor,
    config: WorkerConfig,
}

impl<S> Worker<S>
where
    S: PipelineStore + TenantConfigStore + Clone + 'static,
{
    pub fn new(pipeline: Pipeline<S>, providers: ProviderRegistry, config: WorkerConfig) -> Self {
        Self {
            actor: Actor::worker(config.name.clone()),
            pipeline,
            providers,
            config,
        }
    }

    /// Promote due jobs, lease one entry, deliver it and report the outcome.
    pub async fn run_once(&self) -> PipelineResult<WorkerStep> {
        self.pipeline.promote_due(Utc::now()).await?;

        let Some(lease) = self.pipeline.lease(&self.actor).await? else {
            return Ok(WorkerStep::Idle);
        };
        let job_id = lease.job.id;

        let result = match self.providers.resolve(&lease.job) {
            Some(provider) => {
                debug!(%job_id, provider = provider.name(), "delivering");
                provider.deliver(&lease.job).await
            }
            None => Err(DeliveryFailure::new(format!(
                "no provider configured for channel {}",
                lease.job.channel
            ))
            .with_code(ERROR_NO_PROVIDER)),
        };

        let reported = match result {
            Ok(receipt) => self
                .pipeline
                .report_success(&self.actor, &lease, receipt)
                .await
                .map(|_| WorkerStep::Sent(job_id)),
            Err(failure) => self
                .pipeline
                .report_failure(&self.actor, &lease, failure)
                .await
                .map(|outcome| match outcome.job().current_status {
                    JobStatus::DeadLetter => WorkerStep::DeadLettered(job_id),
                    _ => WorkerStep::Failed(job_id),
                }),
        };

        match reported {
            Err(PipelineError::ConflictingTransition { expected, actual }) => {
                warn!(
                    %job_id,
                    worker = %self.actor.name,
                    %expected,
                    %actual,
                    "job changed during delivery; outcome dropped"
                );
                Ok(WorkerStep::LeaseLost(job_id))
            }
            other => other,
        }
    }

    /// Run on a tokio task until the handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(WorkerStats::default());
        let join = tokio::spawn(self.run(shutdown_rx, stats_tx));

        WorkerHandle {
            shutdown: shutdown_tx,
            stats: stats_rx,
            join,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, stats: watch::Sender<WorkerStats>) {
        info!(worker = %self.config.name, "worker started");

        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(step) => {
                    let idle = step == WorkerStep::Idle;
                    stats.send_modify(|s| s.record(&step));
                    idle
                }
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "worker step failed");
                    true
                }
            };

            if pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // handle dropped
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use jtd_core::{NewJob, RetryPolicy, TenantChannelConfig, TenantId};

    use crate::config::PipelineConfig;
    use crate::store::InMemoryPipelineStore;

    /// Fails the first `failures` attempts.
    struct FlakyProvider {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl DeliveryProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _job: &Job) -> Result<DeliveryReceipt, DeliveryFailure> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(DeliveryFailure::new("connection reset").with_code("NETWORK"))
            } else {
                Ok(DeliveryReceipt::new("smtp").with_cost(0.01))
            }
        }
    }

    async fn live_tenant(store: &InMemoryPipelineStore) -> TenantId {
        let tenant = TenantId::new();
        store
            .upsert_channel_config(TenantChannelConfig::new(tenant, "user_invite").live(true))
            .await
            .unwrap();
        tenant
    }

    fn pipeline(store: Arc<InMemoryPipelineStore>) -> Pipeline<Arc<InMemoryPipelineStore>> {
        Pipeline::new(
            store,
            PipelineConfig::default().with_retry_policy(RetryPolicy::immediate()),
        )
    }

    fn invite(tenant: TenantId) -> NewJob {
        NewJob::new(tenant, Channel::Email, "user.invited", "user_invite", "inv-1")
            .with_email("ada@example.com")
    }

    #[tokio::test]
    async fn test_mode_jobs_use_log_only_provider() {
        let store = InMemoryPipelineStore::arc();
        let pipeline = pipeline(store.clone());
        let id = pipeline
            .create_job(invite(TenantId::new()))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        let worker = Worker::new(
            pipeline.clone(),
            ProviderRegistry::new(),
            WorkerConfig::default(),
        );
        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Sent(id));
        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Idle);

        let job = pipeline.job_detail(id).await.unwrap().job;
        assert_eq!(job.provider_code.as_deref(), Some(LOG_ONLY_PROVIDER_CODE));
    }

    #[tokio::test]
    async fn live_job_without_provider_fails() {
        let store = InMemoryPipelineStore::arc();
        let tenant = live_tenant(&store).await;
        let pipeline = pipeline(store.clone());
        let id = pipeline.create_job(invite(tenant)).await.unwrap().job_id().unwrap();

        let worker = Worker::new(
            pipeline.clone(),
            ProviderRegistry::new(),
            WorkerConfig::default(),
        );
        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Failed(id));

        let job = pipeline.job_detail(id).await.unwrap().job;
        assert_eq!(job.error_code.as_deref(), Some(ERROR_NO_PROVIDER));
    }

    #[tokio::test]
    async fn flaky_provider_succeeds_after_automatic_retry() {
        let store = InMemoryPipelineStore::arc();
        let tenant = live_tenant(&store).await;
        let pipeline = pipeline(store.clone());
        let id = pipeline.create_job(invite(tenant)).await.unwrap().job_id().unwrap();

        let providers = ProviderRegistry::new().with_provider(
            Channel::Email,
            FlakyProvider {
                failures: 1,
                attempts: AtomicU32::new(0),
            },
        );
        let worker = Worker::new(pipeline.clone(), providers, WorkerConfig::default());

        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Failed(id));
        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Sent(id));

        let job = pipeline.job_detail(id).await.unwrap().job;
        assert_eq!(job.current_status, JobStatus::Sent);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.cost, Some(0.01));
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_shuts_down() {
        let store = InMemoryPipelineStore::arc();
        let pipeline = pipeline(store.clone());
        for n in 0..3 {
            let request = NewJob::new(
                TenantId::new(),
                Channel::Inapp,
                "report.ready",
                "report",
                format!("r-{n}"),
            );
            pipeline.create_job(request).await.unwrap();
        }

        let handle = Worker::new(
            pipeline.clone(),
            ProviderRegistry::log_only(),
            WorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        for _ in 0..200 {
            if handle.stats().sent == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.leased, 3);
    }
}
