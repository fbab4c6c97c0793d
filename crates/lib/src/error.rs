//! Failure taxonomy for one message's trip through the pipeline.
//!
//! Components classify at the point of origin (codec, limiter, runtime, publisher); the
//! consumer is the only place that turns a `ProcessError` into drop, retry, or dead-letter.

use crate::envelope::EnvelopeError;
use crate::limiter::AdmitError;
use crate::publisher::PublishError;
use crate::runtime::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MalformedEnvelope,
    RuntimeUnavailable,
    RuntimeRejected,
    RuntimeTimeout,
    Overloaded,
    PublishFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MalformedEnvelope => "malformed_envelope",
            FailureKind::RuntimeUnavailable => "runtime_unavailable",
            FailureKind::RuntimeRejected => "runtime_rejected",
            FailureKind::RuntimeTimeout => "runtime_timeout",
            FailureKind::Overloaded => "overloaded",
            FailureKind::PublishFailure => "publish_failure",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Admission(#[from] AdmitError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl ProcessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessError::Envelope(_) => FailureKind::MalformedEnvelope,
            ProcessError::Runtime(RuntimeError::Unavailable(_)) => FailureKind::RuntimeUnavailable,
            ProcessError::Runtime(RuntimeError::Rejected(_)) => FailureKind::RuntimeRejected,
            ProcessError::Runtime(RuntimeError::Timeout(_)) => FailureKind::RuntimeTimeout,
            ProcessError::Admission(_) => FailureKind::Overloaded,
            ProcessError::Publish(_) => FailureKind::PublishFailure,
        }
    }

    /// Whether another delivery could succeed. Rejections only count when configured to.
    pub fn is_transient(&self, retry_rejected: bool) -> bool {
        match self.kind() {
            FailureKind::MalformedEnvelope => false,
            FailureKind::RuntimeRejected => retry_rejected,
            FailureKind::RuntimeUnavailable
            | FailureKind::RuntimeTimeout
            | FailureKind::Overloaded
            | FailureKind::PublishFailure => true,
        }
    }
}
