//! Retry, backoff and cap policies per job kind.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobKind;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^failures
    #[default]
    Exponential,
    /// Linear backoff: base * failures
    Linear,
}

/// Backoff applied when a failed job is made eligible again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Exponential backoff without jitter, for deterministic schedules.
    pub fn no_jitter(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            jitter: 0.0,
            ..Self::exponential(base_delay, max_delay)
        }
    }

    /// Delay after `failures` recorded failures, before jitter.
    ///
    /// `backoff(n) = min(max_delay, base * 2^n)` for the exponential strategy.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(failures.min(64) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(failures.max(1)),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Delay with jitter derived from `seed`; never exceeds `max_delay`.
    pub fn jittered_delay(&self, failures: u32, seed: u64) -> Duration {
        let delay = self.delay_for_failures(failures);
        if self.jitter <= 0.0 {
            return delay;
        }

        let delay_ms = delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let jitter_range = delay_ms * self.jitter.min(1.0);
        let unit = unit_interval(seed ^ u64::from(failures));
        let jittered = delay_ms + jitter_range * (unit * 2.0 - 1.0);

        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }
}

/// Map a seed onto [0, 1) (splitmix64 finaliser).
fn unit_interval(seed: u64) -> f64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// How handler errors are classified for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Trust the handler's retryable/fatal hint.
    #[default]
    FollowHandler,
    /// Retry every error until the failure cap.
    RetryAll,
    /// Never retry; any error is terminal.
    NeverRetry,
}

impl ErrorPolicy {
    pub fn is_retryable(&self, handler_hint: bool) -> bool {
        match self {
            ErrorPolicy::FollowHandler => handler_hint,
            ErrorPolicy::RetryAll => true,
            ErrorPolicy::NeverRetry => false,
        }
    }
}

/// Caps and retry behaviour for one job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Handler failures tolerated before a retryable error becomes terminal.
    pub max_failures: u32,
    /// Lease reclamations tolerated before the job is quarantined.
    pub max_resets: u32,
    pub retry: RetryPolicy,
    pub errors: ErrorPolicy,
    /// Enqueue the next stage automatically when a staged job completes.
    pub chain_stages: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            max_resets: 3,
            retry: RetryPolicy::default(),
            errors: ErrorPolicy::default(),
            chain_stages: true,
        }
    }
}

impl JobPolicy {
    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = max;
        self
    }

    pub fn with_max_resets(mut self, max: u32) -> Self {
        self.max_resets = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_errors(mut self, errors: ErrorPolicy) -> Self {
        self.errors = errors;
        self
    }
}

/// Policy lookup by kind, falling back to a default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPolicies {
    default: JobPolicy,
    per_kind: HashMap<JobKind, JobPolicy>,
}

impl JobPolicies {
    pub fn new(default: JobPolicy) -> Self {
        Self {
            default,
            per_kind: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: JobKind, policy: JobPolicy) -> Self {
        self.per_kind.insert(kind, policy);
        self
    }

    pub fn for_kind(&self, kind: JobKind) -> &JobPolicy {
        self.per_kind.get(&kind).unwrap_or(&self.default)
    }
}
