//! Error definitions.

use thiserror::Error;

/// Errors raised by the mocking engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A live call matched no answer and has no intrinsic default.
    #[error("no answer found for: {0}")]
    UnansweredCall(String),

    /// Capture rounds disagreed on the calls made by a declaration block.
    #[error("ambiguous capture round {round}: {detail}")]
    AmbiguousCaptureRound {
        /// Round in which the disagreement was detected
        round: usize,
        /// What differed
        detail: String,
    },

    /// A declaration block produced no calls.
    #[error("missing calls inside {0} block")]
    EmptyExpectation(&'static str),

    /// Verification did not hold.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// A matcher was created inside a block but never passed to a mock.
    #[error("{count} matcher(s) were not used as mock call arguments: {matchers}")]
    UnusedMatcher {
        /// Number of dangling matchers
        count: usize,
        /// Rendering of the dangling matchers
        matchers: String,
    },

    /// Number of matchers differs from the method's parameter count.
    #[error("{method} expects {expected} argument(s), got {actual} matcher(s)")]
    ArityMismatch {
        /// Method name
        method: String,
        /// Declared parameter count
        expected: usize,
        /// Matchers supplied
        actual: usize,
    },

    /// A capture session was started while another one is still open.
    #[error("a {0} block is already being recorded on this thread")]
    SessionAlreadyOpen(&'static str),

    /// An operation needs an open capture session.
    #[error("no {0} block is being recorded on this thread")]
    NoSession(&'static str),

    /// The mock session that owns a mock has been dropped.
    #[error("mock session is closed")]
    SessionClosed,

    /// An answer raised an error on purpose.
    #[error("{0}")]
    Thrown(String),

    /// The real implementation was requested but none is bound.
    #[error("no original implementation for: {0}")]
    NoOriginalCall(String),

    /// An instance factory was unregistered twice.
    #[error("instance factory {0} is not registered")]
    FactoryNotRegistered(u64),

    /// A template answer failed to render.
    #[error("template error: {0}")]
    Template(String),

    /// A regex or glob matcher pattern failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

impl Error {
    /// Create an ambiguous round error.
    #[must_use]
    pub fn ambiguous(round: usize, detail: impl Into<String>) -> Self {
        Self::AmbiguousCaptureRound {
            round,
            detail: detail.into(),
        }
    }

    /// Create an error raised by a throwing answer.
    #[must_use]
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(message.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
