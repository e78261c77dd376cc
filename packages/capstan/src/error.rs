//! Structured error types and handler failure classification.
//!
//! `CoordinationError` covers synchronous precondition and validation
//! failures reported directly to callers. Storage round-trips use
//! `anyhow::Result` as internal transport; dispatchers classify handler
//! failures through [`FailureKind`] and never let one message's error
//! take down the loop.

use std::fmt;

use thiserror::Error;

/// Precondition and validation failures surfaced synchronously to callers.
///
/// Eventual delivery failures are never reported here; they are visible only
/// through a row's terminal status.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A claim was requested with a batch size outside the accepted range.
    #[error("invalid batch size {got}: must be between 1 and {max}")]
    InvalidBatchSize { got: usize, max: usize },

    /// A resource, semaphore, or job name was empty or too long.
    #[error("invalid name: {reason}")]
    InvalidName { reason: String },

    /// An inbox message id violated the length contract.
    #[error("message id is {got} characters; the limit is {max}")]
    MessageIdTooLong { got: usize, max: usize },

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Two handlers were registered for the same topic.
    #[error("handler already registered for topic `{topic}`")]
    HandlerAlreadyRegistered { topic: String },

    /// A cron expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidCron { expression: String, message: String },

    /// A job was referenced by a name that has no definition.
    #[error("no job definition named `{name}`")]
    UnknownJob { name: String },

    /// A join declared an expected step count its member set cannot satisfy.
    #[error("expected_steps {expected} is outside 1..={members}")]
    InvalidExpectedSteps { expected: u32, members: usize },
}

/// Largest batch a single claim may request.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Validates a claim batch size. Zero is rejected before any I/O happens.
pub fn ensure_batch_size(batch_size: usize) -> Result<(), CoordinationError> {
    if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
        return Err(CoordinationError::InvalidBatchSize {
            got: batch_size,
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Validates a resource/semaphore/job name: non-empty, at most 256 bytes.
pub fn ensure_name(name: &str) -> Result<(), CoordinationError> {
    if name.is_empty() {
        return Err(CoordinationError::InvalidName {
            reason: "name must not be empty".to_string(),
        });
    }
    if name.len() > 256 {
        return Err(CoordinationError::InvalidName {
            reason: format!("name is {} bytes; the limit is 256", name.len()),
        });
    }
    Ok(())
}

/// Classification of a handler failure.
///
/// Transient failures are retried with backoff until the attempt budget is
/// spent; permanent failures dead-letter the row immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with backoff.
    Transient,
    /// Dead-letter immediately.
    Permanent,
}

impl FailureKind {
    /// Whether the dispatcher should schedule another attempt.
    pub fn should_retry(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// A classified failure returned by a message handler.
///
/// Handlers wrap their underlying error and declare whether it is worth
/// retrying. The dispatcher turns this into an `abandon` (transient, budget
/// remaining) or a `fail` (permanent, or budget exhausted).
#[derive(Debug)]
pub struct HandlerFailure {
    kind: FailureKind,
    error: anyhow::Error,
}

impl HandlerFailure {
    /// A failure worth retrying (network hiccup, lock contention, 5xx).
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Transient,
            error: error.into(),
        }
    }

    /// A failure that will never succeed (malformed payload, 4xx).
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            error: error.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Transient => write!(f, "transient failure: {}", self.error),
            FailureKind::Permanent => write!(f, "permanent failure: {}", self.error),
        }
    }
}

impl std::error::Error for HandlerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}
