//! Unified error handling for gpupool
//!
//! All fallible allocator operations return [`PoolResult`]. The error kinds
//! map one-to-one onto the conditions the allocator can surface to callers:
//! oversized requests, resource-count backpressure, invalid wired limits,
//! and driver allocation failures that a caller chose to promote into an
//! error via [`crate::GpuBuffer::non_null`].

use std::fmt;

/// Unified error type for gpupool
#[derive(Debug, Clone, thiserror::Error)]
pub enum GpuPoolError {
    /// Requested size exceeds the driver's maximum buffer length
    #[error(
        "attempting to allocate {requested} bytes which is greater than \
         the maximum allowed buffer size of {max} bytes"
    )]
    OversizedRequest { requested: usize, max: usize },

    /// Device resource count still at the limit after cache eviction
    #[error("resource limit ({0}) exceeded")]
    ResourceLimitExceeded(usize),

    /// Caller-supplied argument outside the device's accepted range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Driver returned no buffer for both the heap and the direct attempt
    #[error("GPU buffer allocation failed: {0}")]
    AllocationFailed(String),
}

impl GpuPoolError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            GpuPoolError::OversizedRequest { .. } | GpuPoolError::InvalidArgument(_) => {
                ErrorCategory::User
            }
            GpuPoolError::ResourceLimitExceeded(_) => ErrorCategory::Recoverable,
            GpuPoolError::AllocationFailed(_) => ErrorCategory::Backend,
        }
    }

    /// Check if this error is a temporary condition the caller may retry
    /// after freeing buffers or clearing the cache
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this is a user-facing error (actionable by the caller)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid request or argument
    User,
    /// Temporary memory-pressure condition
    Recoverable,
    /// Driver-side failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

/// Result alias used throughout the crate
pub type PoolResult<T> = std::result::Result<T, GpuPoolError>;
