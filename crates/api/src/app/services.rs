//! Service wiring: picks a storage backend and builds the pipeline, recovery
//! operations and (optionally) the in-process worker on top of it.

use std::sync::Arc;

use tracing::info;

use jtd_infra::{
    InMemoryPipelineStore, Pipeline, PipelineConfig, PostgresPipelineStore, ProviderRegistry,
    Recovery, SharedBackend, Worker, WorkerConfig, WorkerHandle,
};

pub struct AppServices {
    pub pipeline: Pipeline<SharedBackend>,
    pub recovery: Recovery<SharedBackend>,
}

impl AppServices {
    pub fn new(store: SharedBackend, config: PipelineConfig) -> Self {
        let recovery = Recovery::new(store.clone(), &config);
        Self {
            pipeline: Pipeline::new(store, config),
            recovery,
        }
    }

    /// Process-local backend; state is lost on restart.
    pub fn in_memory(config: PipelineConfig) -> Self {
        Self::new(Arc::new(InMemoryPipelineStore::new()), config)
    }

    /// Postgres backend. Runs migrations before returning.
    pub async fn postgres(database_url: &str, config: PipelineConfig) -> anyhow::Result<Self> {
        let store = PostgresPipelineStore::connect(database_url).await?;
        store.migrate().await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Start the reference worker with log-only providers.
    pub fn spawn_worker(&self, config: WorkerConfig) -> WorkerHandle {
        info!(worker = %config.name, "starting in-process worker");
        Worker::new(self.pipeline.clone(), ProviderRegistry::log_only(), config).spawn()
    }
}

/// Backend chosen from the environment: Postgres when `DATABASE_URL` is set,
/// in-memory otherwise.
pub async fn build_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            info!("using postgres backend");
            AppServices::postgres(&url, config).await
        }
        _ => {
            info!("DATABASE_URL not set; using in-memory backend");
            Ok(AppServices::in_memory(config))
        }
    }
}
