//! Pipeline configuration.

use std::str::FromStr;
use std::time::Duration;

use jtd_core::RetryPolicy;

/// Longest accepted lease. Larger values are clamped.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Longest accepted retry delay. Larger values are clamped.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 3600);

pub const DEFAULT_BLOCKING_ERROR_CODES: [&str; 2] = ["NO_CREDITS", "INSUFFICIENT_CREDITS"];

/// Tunables shared by the pipeline service, recovery operations and metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// How long a leased entry stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    pub default_max_retries: u32,
    /// Priority for jobs created without one and for DLQ requeues.
    pub default_priority: i32,
    /// Backoff between automatic retries of `failed` jobs.
    pub retry: RetryPolicy,
    /// DLQ messages read at least this many times are flagged as poison.
    pub poison_read_threshold: u32,
    /// Error codes that mark a job as blocked on an external precondition.
    pub blocking_error_codes: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            default_max_retries: 3,
            default_priority: 5,
            retry: RetryPolicy::default(),
            poison_read_threshold: 5,
            blocking_error_codes: DEFAULT_BLOCKING_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `JTD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparseable values keep the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            base_delay: capped(
                "JTD_RETRY_BASE_DELAY_MS",
                Duration::from_millis(parse_or(
                    &lookup,
                    "JTD_RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay.as_millis() as u64,
                )),
                MAX_RETRY_DELAY,
            ),
            max_delay: capped(
                "JTD_RETRY_MAX_DELAY_MS",
                Duration::from_millis(parse_or(
                    &lookup,
                    "JTD_RETRY_MAX_DELAY_MS",
                    defaults.retry.max_delay.as_millis() as u64,
                )),
                MAX_RETRY_DELAY,
            ),
            ..defaults.retry.clone()
        };

        Self {
            visibility_timeout: capped(
                "JTD_VISIBILITY_TIMEOUT_SECS",
                Duration::from_secs(parse_or(
                    &lookup,
                    "JTD_VISIBILITY_TIMEOUT_SECS",
                    defaults.visibility_timeout.as_secs(),
                )),
                MAX_VISIBILITY_TIMEOUT,
            ),
            default_max_retries: parse_or(
                &lookup,
                "JTD_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            default_priority: parse_or(&lookup, "JTD_DEFAULT_PRIORITY", defaults.default_priority),
            retry,
            poison_read_threshold: parse_or(
                &lookup,
                "JTD_POISON_READ_THRESHOLD",
                defaults.poison_read_threshold,
            ),
            blocking_error_codes: defaults.blocking_error_codes,
        }
    }

    /// Clamped to [`MAX_VISIBILITY_TIMEOUT`].
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout.min(MAX_VISIBILITY_TIMEOUT);
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    /// Delays are clamped to [`MAX_RETRY_DELAY`].
    pub fn with_retry_policy(mut self, mut policy: RetryPolicy) -> Self {
        policy.base_delay = policy.base_delay.min(MAX_RETRY_DELAY);
        policy.max_delay = policy.max_delay.min(MAX_RETRY_DELAY);
        self.retry = policy;
        self
    }

    pub fn with_poison_read_threshold(mut self, threshold: u32) -> Self {
        self.poison_read_threshold = threshold;
        self
    }

    pub fn with_blocking_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocking_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn visibility_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.visibility_timeout.min(MAX_VISIBILITY_TIMEOUT))
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

fn capped(key: &str, value: Duration, max: Duration) -> Duration {
    if value > max {
        tracing::warn!(key, value = ?value, max = ?max, "config value too large; clamping");
        return max;
    }
    value
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    default = ?default,
                    "unparseable config value; using default"
                );
                default
            }
        },
    }
}
