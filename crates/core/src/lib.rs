//! `jtd-core` — the Job-To-Deliver notification pipeline domain.
//!
//! This crate contains **pure domain** logic (no infrastructure concerns):
//! the JTD record, its legal status transitions, the audit trail they
//! produce, and the decisions taken while a job is leased.

pub mod delivery;
pub mod error;
pub mod history;
pub mod id;
pub mod job;
pub mod retry;
pub mod status;
pub mod tenant;

pub use delivery::{DeliveryFailure, DeliveryReceipt, LeaseStep};
pub use error::{PipelineError, PipelineResult};
pub use history::StatusHistoryEntry;
pub use id::{HistoryId, JobId, MessageId, TenantId};
pub use job::{Actor, ActorKind, Channel, Job, JobPatch, NewJob, RecipientData};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use status::JobStatus;
pub use tenant::TenantChannelConfig;
