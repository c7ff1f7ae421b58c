use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 600_000;

/// Coarse classification of a job failure, used to pick the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// A referenced record does not exist.
    NotFound,
    /// Busy database, pool exhaustion, I/O, worker timeout.
    Transient,
    /// Anything retrying cannot fix, e.g. an undecodable payload.
    Permanent,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 3] = [
        ErrorClass::NotFound,
        ErrorClass::Transient,
        ErrorClass::Permanent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error class: {0}")]
pub struct UnknownErrorClass(pub String);

impl FromStr for ErrorClass {
    type Err = UnknownErrorClass;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_found" => Ok(Self::NotFound),
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            other => Err(UnknownErrorClass(other.to_string())),
        }
    }
}

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    /// `min(max, base * 2^retry)`, drawn uniformly from `[0, ceiling]` when `jitter` is set.
    Exponential { base_ms: u64, max_ms: u64, jitter: bool },
}

impl Backoff {
    /// Exponential backoff starting at one second, capped at ten minutes, with full jitter.
    pub fn exponential() -> Self {
        Self::Exponential {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter: true,
        }
    }

    /// Upper bound of the delay before retry number `retry` (0-based).
    pub fn ceiling(&self, retry: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                base_ms, max_ms, ..
            } => {
                let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }

    /// Delay before retry number `retry`; `sample` is a uniform draw in `[0, 1]`
    /// and only matters when jitter is enabled.
    pub fn delay(&self, retry: u32, sample: f64) -> Duration {
        let ceiling = self.ceiling(retry);
        match *self {
            Self::Exponential { jitter: true, .. } => ceiling.mul_f64(sample.clamp(0.0, 1.0)),
            _ => ceiling,
        }
    }
}

/// Outcome of evaluating a failure against a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again; `retry` is the 0-based index of the upcoming retry.
    Retry { retry: u32 },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    Exhausted,
}

impl GiveUpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRetryable => "not_retryable",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Retry policy attached to every enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on: BTreeSet<ErrorClass>,
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
            retry_on: BTreeSet::new(),
        }
    }

    /// Retry every error class up to `max_retries` times.
    pub fn on_any_error(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            retry_on: ErrorClass::ALL.into_iter().collect(),
        }
    }

    pub fn with_retry_on(mut self, classes: impl IntoIterator<Item = ErrorClass>) -> Self {
        self.retry_on = classes.into_iter().collect();
        self
    }

    pub fn retries(&self, class: ErrorClass) -> bool {
        self.retry_on.contains(&class)
    }

    /// Decides what happens after a failed attempt, given how many retries already ran.
    pub fn decide(&self, retries_so_far: u32, class: ErrorClass) -> RetryDecision {
        if !self.retries(class) {
            return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
        }
        if retries_so_far >= self.max_retries {
            return RetryDecision::GiveUp(GiveUpReason::Exhausted);
        }
        RetryDecision::Retry {
            retry: retries_so_far,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
