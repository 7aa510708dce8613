//! Error types for the sandbox engine
//!
//! Only infrastructure faults are errors here. Code that exceeds its limits
//! is not an engine failure: it comes back as a normal [`SandboxResult`]
//! with `was_killed` set.
//!
//! [`SandboxResult`]: crate::SandboxResult

/// Sandbox engine error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// The execution environment could not be provisioned
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// The engine failed while supervising a run
    #[error("sandbox internal error: {0}")]
    Internal(String),

    /// The request cannot be executed as given
    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
}

impl SandboxError {
    /// Create an unavailable error
    #[inline]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create an internal error
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an invalid request error
    #[inline]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Check if the error is an infrastructure fault (as opposed to a bad request)
    #[inline]
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Internal(_))
    }
}
