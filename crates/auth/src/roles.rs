use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier carried in tokens.
///
/// Roles stay opaque strings at this layer; the pipeline only recognises
/// [`Role::ADMIN`] and [`Role::SERVICE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Operators allowed to run recovery operations and admin reads.
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));

    /// Collaborating services that create jobs and query their status.
    pub const SERVICE: Role = Role(Cow::Borrowed("service"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
