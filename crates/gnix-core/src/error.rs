//! Error types for the GNIX provider
//!
//! Codes follow the libfabric convention: `errno()` returns the positive
//! `FI_E*` value a C caller would see negated.

use core::fmt;

/// libfabric-specific codes start past the POSIX range.
pub const FI_ERRNO_OFFSET: i32 = 256;
/// Provided buffer is too small
pub const FI_ETOOSMALL: i32 = FI_ERRNO_OFFSET + 1;
/// Error available on the error queue
pub const FI_EAVAIL: i32 = FI_ERRNO_OFFSET + 3;

/// Result type for provider operations
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors returned by provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    /// Missing/illegal field or illegal state transition
    InvalidArgument,

    /// Allocation failed at some layer
    NoMemory,

    /// Optional feature not implemented (wait objects, blocking read)
    NotSupported,

    /// Close attempted while the object is still referenced
    Busy,

    /// Non-blocking operation found nothing ready
    Again,

    /// Error queue must be drained before normal reads proceed
    ErrorAvailable,

    /// Caller buffer undersized; the record is kept for retry
    TooSmall,

    /// Peer did not answer the connection handshake
    ConnRefused,

    /// Any other OS/provider errno
    Os(i32),
}

impl FabricError {
    /// Positive libfabric error code for this error.
    pub const fn errno(&self) -> i32 {
        match self {
            FabricError::InvalidArgument => libc::EINVAL,
            FabricError::NoMemory => libc::ENOMEM,
            FabricError::NotSupported => libc::ENOSYS,
            FabricError::Busy => libc::EBUSY,
            FabricError::Again => libc::EAGAIN,
            FabricError::ErrorAvailable => FI_EAVAIL,
            FabricError::TooSmall => FI_ETOOSMALL,
            FabricError::ConnRefused => libc::ECONNREFUSED,
            FabricError::Os(e) => *e,
        }
    }

    /// Map a positive (or negated) errno back to an error.
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            libc::EINVAL => FabricError::InvalidArgument,
            libc::ENOMEM => FabricError::NoMemory,
            libc::ENOSYS => FabricError::NotSupported,
            libc::EBUSY => FabricError::Busy,
            libc::EAGAIN => FabricError::Again,
            FI_EAVAIL => FabricError::ErrorAvailable,
            FI_ETOOSMALL => FabricError::TooSmall,
            libc::ECONNREFUSED => FabricError::ConnRefused,
            e => FabricError::Os(e),
        }
    }

    /// True for "nothing ready yet" conditions a poller should retry.
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, FabricError::Again)
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::InvalidArgument => write!(f, "invalid argument"),
            FabricError::NoMemory => write!(f, "out of memory"),
            FabricError::NotSupported => write!(f, "operation not supported"),
            FabricError::Busy => write!(f, "resource busy"),
            FabricError::Again => write!(f, "try again"),
            FabricError::ErrorAvailable => write!(f, "error available"),
            FabricError::TooSmall => write!(f, "buffer too small"),
            FabricError::ConnRefused => write!(f, "connection refused"),
            FabricError::Os(e) => write!(f, "provider error: errno {}", e),
        }
    }
}

impl std::error::Error for FabricError {}

impl From<std::collections::TryReserveError> for FabricError {
    fn from(_: std::collections::TryReserveError) -> Self {
        FabricError::NoMemory
    }
}

/// Returned by `close()` on a shared object that is still referenced.
///
/// Carries the handle back so the caller can retry once references drop.
pub struct CloseError<T> {
    pub handle: T,
    pub error: FabricError,
}

impl<T> CloseError<T> {
    pub fn new(handle: T, error: FabricError) -> Self {
        Self { handle, error }
    }

    /// Discard the handle and keep the error.
    pub fn into_error(self) -> FabricError {
        self.error
    }
}

impl<T> fmt::Debug for CloseError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseError").field("error", &self.error).finish()
    }
}

impl<T> fmt::Display for CloseError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close failed: {}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", FabricError::Again), "try again");
        assert_eq!(format!("{}", FabricError::Os(5)), "provider error: errno 5");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FabricError::TooSmall.errno(), 257);
        assert_eq!(FabricError::ErrorAvailable.errno(), 259);
        assert_eq!(FabricError::from_errno(-libc::EAGAIN), FabricError::Again);
        assert_eq!(FabricError::from_errno(libc::EBUSY), FabricError::Busy);
        assert_eq!(FabricError::from_errno(libc::EIO), FabricError::Os(libc::EIO));
    }

    #[test]
    fn test_errno_inverse() {
        let all = [
            FabricError::InvalidArgument,
            FabricError::NoMemory,
            FabricError::NotSupported,
            FabricError::Busy,
            FabricError::Again,
            FabricError::ErrorAvailable,
            FabricError::TooSmall,
            FabricError::ConnRefused,
        ];
        for e in all {
            assert_eq!(FabricError::from_errno(e.errno()), e);
        }
    }

    #[test]
    fn test_close_error_keeps_handle() {
        let err = CloseError::new(7u32, FabricError::Busy);
        assert_eq!(err.handle, 7);
        assert_eq!(err.into_error(), FabricError::Busy);
    }
}
