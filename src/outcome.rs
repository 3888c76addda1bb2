use crate::{classify::DiscardReason, run_spec::ValidationError};
use std::fmt;
use thiserror::Error;

/// Conditions that end a measurement run. Samples persisted before the
/// failure are kept.
#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("request validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("function invocation failed: {0}")]
    FunctionError(String),
    #[error("function is in failed state")]
    FailedState,
    #[error("unexpected function state: {0}")]
    UnexpectedState(String),
    #[error("function did not become ready after {0} polls")]
    NotReady(u32),
    #[error("too many failed measurement attempts ({0} in a row)")]
    TooManyFailures(u32),
    #[error("function lifecycle provider failed: {0:#}")]
    Provider(anyhow::Error),
    #[error("measurement state store failed: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The configuration update collided with one still in flight.
    Conflict,
    Discarded(DiscardReason),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Conflict => write!(f, "configuration update conflict"),
            RetryReason::Discarded(reason) => write!(f, "{reason}"),
        }
    }
}

/// Result of one stage of a cold-start attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    Valid(T),
    Retry(RetryReason),
    RateLimited,
    Fatal(MeasureError),
}

/// Unwraps a valid outcome, returning any other outcome from the enclosing
/// function.
macro_rules! valid {
    ($outcome:expr) => {
        match $outcome {
            $crate::outcome::Outcome::Valid(value) => value,
            $crate::outcome::Outcome::Retry(reason) => {
                return $crate::outcome::Outcome::Retry(reason)
            }
            $crate::outcome::Outcome::RateLimited => {
                return $crate::outcome::Outcome::RateLimited
            }
            $crate::outcome::Outcome::Fatal(e) => return $crate::outcome::Outcome::Fatal(e),
        }
    };
}
pub(crate) use valid;
