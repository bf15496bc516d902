//! Retry policy evaluation
//!
//! Backoff here feeds replayed decisions and the history pagination loop, so
//! it is deliberately jitter-free: the same attempt number must always map to
//! the same sleep.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default backoff multiplier applied when a policy leaves the coefficient
/// unset (zero).
pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;

/// Cap multiplier used when no maximum interval is configured.
const UNSET_MAXIMUM_INTERVAL_FACTOR: u32 = 100;

/// Errors from retry policy validation
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryPolicyError {
    /// Initial interval must be positive
    #[error("initial_interval must be greater than zero")]
    InitialIntervalNotPositive,

    /// Backoff coefficient must be at least one
    #[error("backoff_coefficient must be at least 1, got {0}")]
    BackoffCoefficientTooSmall(String),

    /// Maximum attempts, when set, must be at least one
    #[error("maximum_attempts must be at least 1 when set")]
    MaximumAttemptsNotPositive,

    /// Maximum interval, when set, must be positive
    #[error("maximum_interval must be greater than zero when set")]
    MaximumIntervalNotPositive,
}

/// Retry policy consumed by the executor
///
/// Governs local activity retries and pagination backoff, and travels on
/// outbound commands so the service can apply the same rules to remote
/// attempts.
///
/// # Example
///
/// ```
/// use redrive_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_secs(1))
///     .with_backoff_coefficient(2.0)
///     .with_maximum_interval(Duration::from_secs(10))
///     .with_maximum_attempts(5);
///
/// assert_eq!(policy.sleep_time(1), Duration::from_millis(1000));
/// assert_eq!(policy.sleep_time(4), Duration::from_millis(8000));
/// assert_eq!(policy.sleep_time(5), Duration::from_millis(10000));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Backoff multiplier; 0 means "use the default of 2.0"
    pub backoff_coefficient: f64,

    /// Maximum number of attempts including the first; 0 means unlimited
    pub maximum_attempts: u32,

    /// Ceiling on the computed interval; defaults to 100x the initial
    /// interval when unset
    #[serde(with = "option_duration_millis")]
    pub maximum_interval: Option<Duration>,

    /// Error types that must never be retried
    #[serde(default)]
    pub non_retryable_types: Vec<String>,
}

impl RetryPolicy {
    /// Create a policy with the given initial interval and defaults for the
    /// rest
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            maximum_attempts: 0,
            maximum_interval: None,
            non_retryable_types: vec![],
        }
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_maximum_attempts(mut self, maximum_attempts: u32) -> Self {
        self.maximum_attempts = maximum_attempts;
        self
    }

    /// Set the maximum interval
    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_type(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_types.push(error_type.into());
        self
    }

    /// Check the configuration rules
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.initial_interval.is_zero() {
            return Err(RetryPolicyError::InitialIntervalNotPositive);
        }
        if self.backoff_coefficient != 0.0 && self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::BackoffCoefficientTooSmall(
                self.backoff_coefficient.to_string(),
            ));
        }
        if let Some(max) = self.maximum_interval {
            if max.is_zero() {
                return Err(RetryPolicyError::MaximumIntervalNotPositive);
            }
        }
        Ok(())
    }

    /// Sleep before the given attempt (1-based)
    ///
    /// `raw = initial * coefficient^(attempt - 1)`, capped at the maximum
    /// interval (or 100x the initial interval when none is set), floored to
    /// whole milliseconds after the cap.
    pub fn sleep_time(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let coefficient = if self.backoff_coefficient == 0.0 {
            DEFAULT_BACKOFF_COEFFICIENT
        } else {
            self.backoff_coefficient
        };

        let initial_ms = self.initial_interval.as_millis() as f64;
        let raw = initial_ms * coefficient.powi(attempt as i32 - 1);
        let cap_ms = match self.maximum_interval {
            Some(max) => max.as_millis() as f64,
            None => initial_ms * UNSET_MAXIMUM_INTERVAL_FACTOR as f64,
        };

        Duration::from_millis(raw.min(cap_ms).floor() as u64)
    }

    /// Decide whether retrying must stop
    ///
    /// Stops when the error type is listed as non-retryable, when the attempt
    /// limit is reached, or when the next sleep would cross the expiration.
    pub fn should_stop(
        &self,
        error_type: Option<&str>,
        attempt: u32,
        elapsed: Duration,
        sleep: Duration,
        expiration: Option<Duration>,
    ) -> bool {
        if let Some(error_type) = error_type {
            if self.non_retryable_types.iter().any(|t| t == error_type) {
                return true;
            }
        }
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts {
            return true;
        }
        if let Some(expiration) = expiration {
            if elapsed + sleep >= expiration {
                return true;
            }
        }
        false
    }
}

/// Partially specified retry policy
///
/// Used to merge a policy declared on the workflow or activity definition
/// (the "annotation") with one passed explicitly at call time. `None` means
/// "not configured"; an explicitly empty `non_retryable_types` wins over a
/// populated one from the base.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryOptions {
    #[serde(with = "option_duration_millis", default)]
    pub initial_interval: Option<Duration>,
    pub backoff_coefficient: Option<f64>,
    pub maximum_attempts: Option<u32>,
    #[serde(with = "option_duration_millis", default)]
    pub maximum_interval: Option<Duration>,
    pub non_retryable_types: Option<Vec<String>>,
}

impl RetryOptions {
    /// Merge two partial policies; fields set on `overrides` win
    pub fn merge(base: &RetryOptions, overrides: &RetryOptions) -> RetryOptions {
        RetryOptions {
            initial_interval: overrides.initial_interval.or(base.initial_interval),
            backoff_coefficient: overrides.backoff_coefficient.or(base.backoff_coefficient),
            maximum_attempts: overrides.maximum_attempts.or(base.maximum_attempts),
            maximum_interval: overrides.maximum_interval.or(base.maximum_interval),
            non_retryable_types: overrides
                .non_retryable_types
                .clone()
                .or_else(|| base.non_retryable_types.clone()),
        }
    }

    /// Resolve into a concrete policy, applying defaults and validating
    pub fn into_policy(self) -> Result<RetryPolicy, RetryPolicyError> {
        if let Some(attempts) = self.maximum_attempts {
            if attempts == 0 {
                return Err(RetryPolicyError::MaximumAttemptsNotPositive);
            }
        }
        let policy = RetryPolicy {
            initial_interval: self
                .initial_interval
                .unwrap_or_else(|| Duration::from_secs(1)),
            backoff_coefficient: self
                .backoff_coefficient
                .unwrap_or(DEFAULT_BACKOFF_COEFFICIENT),
            maximum_attempts: self.maximum_attempts.unwrap_or(0),
            maximum_interval: self.maximum_interval,
            non_retryable_types: self.non_retryable_types.unwrap_or_default(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
