use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use jtd_core::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "pipeline storage failure");
    }
    json_error(status, err.code(), err.to_string())
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::NotFound(_) | PipelineError::DlqMessageNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidTransition { .. }
        | PipelineError::NotRetryable { .. }
        | PipelineError::NotCancellable { .. }
        | PipelineError::NotInProcessing { .. }
        | PipelineError::ConflictingTransition { .. } => StatusCode::CONFLICT,
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": message.into(),
            "code": code,
        })),
    )
        .into_response()
}

/// Parse a path segment, answering 400 `validation` on failure.
pub fn parse_path<T>(raw: &str, what: &str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr,
{
    raw.parse::<T>().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("invalid {what}: {raw}"),
        )
    })
}

/// Malformed JSON bodies and query strings share the `validation` code.
pub fn rejection_to_response(rejection: impl std::fmt::Display) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation", rejection.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jtd_core::{JobId, JobStatus, MessageId};

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(status_for(&PipelineError::NotFound(JobId::new())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&PipelineError::DlqMessageNotFound(MessageId::new(7))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&PipelineError::NotCancellable {
                status: JobStatus::Processing
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&PipelineError::ConflictingTransition {
                expected: JobStatus::Processing,
                actual: JobStatus::Sent,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&PipelineError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::Storage("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_path_segment_is_a_validation_error() {
        let res = parse_path::<JobId>("not-a-uuid", "job id").unwrap_err();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(parse_path::<MessageId>("42", "message id").is_ok());
    }
}
