//! Process-wide logging setup for pipeline binaries.

/// Initialize tracing/logging with settings read from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogSettings::from_env());
}

pub mod tracing;
