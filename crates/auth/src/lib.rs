//! `jtd-auth` — authentication boundary for pipeline actors.
//!
//! Decoupled from HTTP and storage: it turns a bearer token into a validated
//! [`Principal`] and answers role checks.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, Principal, require_any_role, require_role};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use principal::PrincipalId;
pub use roles::Role;
