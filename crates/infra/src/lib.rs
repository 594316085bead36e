//! Infrastructure layer: storage backends, the pipeline service, admin
//! recovery, the channel gate, metrics and the reference worker.

pub mod config;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod recovery;
pub mod store;
pub mod worker;

pub use config::PipelineConfig;
pub use gate::ChannelGate;
pub use metrics::{QueueMetricsAggregator, QueueMetricsSnapshot};
pub use pipeline::{CreateOutcome, DlqMessage, JobDetail, JobStatusView, Pipeline, PromoteReport};
pub use recovery::{AdminActor, ForceOutcome, PurgeReport, Recovery};
pub use store::{
    ChangeOutcome, InMemoryPipelineStore, JobFilter, Lease, Page, Pagination, PipelineBackend,
    PipelineStore, PostgresPipelineStore, SharedBackend, StoreError, StoreResult,
    TenantConfigStore,
};
pub use worker::{
    DeliveryProvider, LogOnlyProvider, ProviderRegistry, Worker, WorkerConfig, WorkerHandle,
    WorkerStats, WorkerStep,
};
