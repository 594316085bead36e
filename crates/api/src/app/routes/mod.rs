use axum::Router;

pub mod admin;
pub mod jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(jobs::router())
        .nest("/admin", admin::router())
}
