use std::time::Duration;

/// Outcome errors of a task invocation.
///
/// The variants fall into three groups the worker treats differently:
///
/// - [`Retriable`](Self::Retriable) requests an explicit retry delay and
///   never consumes a retry attempt.
/// - [`Failed`](Self::Failed) and [`Panicked`](Self::Panicked) are normal
///   handler errors, eligible for default backoff while the signature has
///   retries left.
/// - The remaining variants are programming errors in the handler or its
///   registration; retrying cannot fix them, so they fail directly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Handler-domain failure.
    #[error("{0}")]
    Failed(String),

    /// The handler took responsibility for the failure and asked to be
    /// retried after an explicit delay.
    #[error("retry task in {delay:?}: {reason}")]
    Retriable {
        /// How long to wait before the task becomes eligible again.
        delay: Duration,
        /// Why the handler deferred.
        reason: String,
    },

    /// The handler panicked with a payload that was neither an error nor
    /// a message.
    #[error("invoking task caused a panic")]
    Panicked,

    /// The handler produced no return slots at all.
    #[error("task handler returned no values")]
    ReturnsNoValue,

    /// The final return slot held a payload instead of an error report.
    #[error("last return value of a task handler must be an error slot")]
    LastReturnNotError,

    /// The signature carried a different number of arguments than the
    /// handler declares.
    #[error("task takes {expected} arguments but the signature carries {got}")]
    ArityMismatch {
        /// Parameter count declared by the handler.
        expected: usize,
        /// Argument count found on the signature.
        got: usize,
    },

    /// An argument could not be passed as the declared parameter type.
    #[error("argument {index} cannot be passed as {expected}: got {got}")]
    TypeMismatch {
        /// Zero-based argument position.
        index: usize,
        /// Declared parameter kind.
        expected: &'static str,
        /// Runtime type label of the offending argument.
        got: &'static str,
    },
}

impl TaskError {
    /// Creates a handler-domain failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Creates an explicit-delay retry request.
    #[must_use]
    pub fn retry_later(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Retriable {
            delay,
            reason: reason.into(),
        }
    }

    /// The Retriable capability: the requested delay, if this error asked
    /// for an explicit retry.
    #[must_use]
    pub const fn retry_in(&self) -> Option<Duration> {
        match self {
            Self::Retriable { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    /// Returns true for errors the default backoff policy may retry.
    ///
    /// Programming errors (arity, types, malformed returns) stay false:
    /// redelivering the same signature can never change the outcome.
    #[must_use]
    pub const fn eligible_for_backoff(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked)
    }
}
