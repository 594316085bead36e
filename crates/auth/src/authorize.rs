use thiserror::Error;

use crate::{JwtClaims, PrincipalId, Role};

/// An authenticated caller, derived from validated claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub name: String,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

impl From<JwtClaims> for Principal {
    fn from(claims: JwtClaims) -> Self {
        let name = claims
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| claims.sub.to_string());
        Self {
            principal_id: claims.sub,
            name,
            roles: claims.roles,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing role '{0}'")]
    Forbidden(String),
}

/// Require `role`.
///
/// - No IO
/// - No panics
pub fn require_role(principal: &Principal, role: &Role) -> Result<(), AuthzError> {
    if principal.has_role(role) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(role.as_str().to_string()))
    }
}

/// Require at least one of `roles`.
pub fn require_any_role(principal: &Principal, roles: &[Role]) -> Result<(), AuthzError> {
    if roles.iter().any(|r| principal.has_role(r)) {
        Ok(())
    } else {
        let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
        Err(AuthzError::Forbidden(names.join("|")))
    }
}
