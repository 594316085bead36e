//! Operator routes: job inspection, recovery operations, the dead-letter
//! queue, metrics and tenant channel configuration.
//!
//! Every handler requires the `admin` role.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use tracing::info;

use jtd_core::{JobId, MessageId, TenantChannelConfig, TenantId};

use crate::app::dto::{
    ChannelConfigRequest, ForceCompleteRequest, ListJobsQuery, MutationResponse, PageQuery,
    PurgeResponse,
};
use crate::app::{errors, services::AppServices};
use crate::authz;
use crate::context::PrincipalContext;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(job_detail))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/force-complete", post(force_complete))
        .route("/dlq", get(list_dlq))
        .route("/dlq/purge", post(purge_dlq))
        .route("/dlq/:msg_id/requeue", post(requeue_from_dlq))
        .route("/metrics", get(metrics))
        .route(
            "/tenants/:tenant_id/channels/:source_type",
            put(upsert_channel_config),
        )
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/jobs - Filtered, paginated job listing
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    if let Err(res) = authz::require_admin(&principal) {
        return res;
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services
        .pipeline
        .list_jobs(&query.filter(), query.pagination())
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/jobs/:id - Job record with its status history
pub async fn job_detail(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(res) = authz::require_admin(&principal) {
        return res;
    }
    let job_id: JobId = match errors::parse_path(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.pipeline.job_detail(job_id).await {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/dlq - Dead-lettered messages, oldest first
pub async fn list_dlq(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> axum::response::Response {
    if let Err(res) = authz::require_admin(&principal) {
        return res;
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services.pipeline.list_dlq(query.pagination()).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/metrics - Queue metrics snapshot
pub async fn metrics(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(res) = authz::require_admin(&principal) {
        return res;
    }

    match services.pipeline.metrics().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery operations
// ─────────────────────────────────────────────────────────────────────────────

/// POST /admin/jobs/:id/retry - Requeue a failed job
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };
    let job_id: JobId = match errors::parse_path(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.recovery.retry(job_id, &admin).await {
        Ok(_) => ok(format!("job {job_id} requeued for retry")),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /admin/jobs/:id/cancel - Cancel a job that has not reached a worker
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };
    let job_id: JobId = match errors::parse_path(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.recovery.cancel(job_id, &admin).await {
        Ok(_) => ok(format!("job {job_id} cancelled")),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /admin/jobs/:id/force-complete - Override a stuck processing job
pub async fn force_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Result<Json<ForceCompleteRequest>, JsonRejection>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };
    let job_id: JobId = match errors::parse_path(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services
        .recovery
        .force_complete(job_id, body.outcome, &admin)
        .await
    {
        Ok(job) => ok(format!(
            "job {job_id} force-completed as {}",
            job.current_status
        )),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /admin/dlq/:msg_id/requeue - Move a dead-lettered message back to the main queue
pub async fn requeue_from_dlq(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(msg_id): Path<String>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };
    let msg_id: MessageId = match errors::parse_path(&msg_id, "message id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.recovery.requeue_from_dlq(msg_id, &admin).await {
        Ok(job) => ok(format!("message {msg_id} requeued as job {}", job.id)),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /admin/dlq/purge - Drop every dead-lettered message
pub async fn purge_dlq(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };

    match services.recovery.purge_dlq(&admin).await {
        Ok(report) => (StatusCode::OK, Json(PurgeResponse::from(report))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tenant channel configuration
// ─────────────────────────────────────────────────────────────────────────────

/// PUT /admin/tenants/:tenant_id/channels/:source_type - Upsert a channel config row
pub async fn upsert_channel_config(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path((tenant_id, source_type)): Path<(String, String)>,
    body: Result<Json<ChannelConfigRequest>, JsonRejection>,
) -> axum::response::Response {
    let admin = match authz::require_admin(&principal) {
        Ok(admin) => admin,
        Err(res) => return res,
    };
    let tenant_id: TenantId = match errors::parse_path(&tenant_id, "tenant id") {
        Ok(id) => id,
        Err(res) => return res,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    let gate = services.pipeline.gate();
    let current = match gate.channel_config(tenant_id, &source_type).await {
        Ok(current) => current,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    let config = body.apply_to(
        current.unwrap_or_else(|| TenantChannelConfig::new(tenant_id, source_type.clone())),
    );

    match gate.upsert_channel_config(config).await {
        Ok(saved) => {
            info!(
                %tenant_id,
                source_type = %saved.source_type,
                actor = %admin.name(),
                "channel config updated"
            );
            (StatusCode::OK, Json(saved)).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

fn ok(message: String) -> axum::response::Response {
    (StatusCode::OK, Json(MutationResponse::ok(message))).into_response()
}
