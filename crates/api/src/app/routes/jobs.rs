//! Collaborator-facing routes: job creation and delivery status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use jtd_core::NewJob;
use jtd_infra::CreateOutcome;

use crate::app::dto::{CreateJobResponse, StatusQuery};
use crate::app::{errors, services::AppServices};
use crate::authz;
use crate::context::PrincipalContext;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/status", get(job_status))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /jobs - Create a notification job
///
/// 201 when admitted, 200 with `skipped: true` when the tenant disabled the
/// channel.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> axum::response::Response {
    if let Err(res) = authz::require_caller(&principal) {
        return res;
    }
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services.pipeline.create_job(request).await {
        Ok(outcome) => {
            let status = match outcome {
                CreateOutcome::Created { .. } => StatusCode::CREATED,
                CreateOutcome::Skipped { .. } => StatusCode::OK,
            };
            (status, Json(CreateJobResponse::from(outcome))).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /jobs/status?source_type=&source_id= - Latest job for a source entity
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> axum::response::Response {
    if let Err(res) = authz::require_caller(&principal) {
        return res;
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services
        .pipeline
        .get_status(&query.source_type, &query.source_id)
        .await
    {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!(
                "no job for source {}/{}",
                query.source_type, query.source_id
            ),
        ),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
