//! API-side role guards.
//!
//! Checked in the handler before any pipeline call, keeping the pipeline
//! itself auth-agnostic apart from [`AdminActor`].

use axum::http::StatusCode;
use axum::response::Response;

use jtd_auth::{Role, require_any_role};
use jtd_infra::AdminActor;

use crate::app::errors;
use crate::context::PrincipalContext;

/// Roles allowed to create jobs and query delivery status.
pub const CALLER_ROLES: [Role; 2] = [Role::ADMIN, Role::SERVICE];

/// Require the admin role and turn the principal into an [`AdminActor`].
pub fn require_admin(principal: &PrincipalContext) -> Result<AdminActor, Response> {
    AdminActor::from_principal(principal.principal())
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}

/// Require `admin` or `service`.
pub fn require_caller(principal: &PrincipalContext) -> Result<(), Response> {
    require_any_role(principal.principal(), &CALLER_ROLES)
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}
