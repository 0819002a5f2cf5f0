//! Error types for NPU driver operations

use core::fmt;

use syscall::error::{EFAULT, EINVAL, ENOMEM};

/// Driver result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Driver error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Null or malformed input
    InvalidArgument,
    /// Handle not found, or not owned by the caller
    InvalidHandle,
    /// Copy from user memory failed
    Fault,
    /// Allocation failure at any layer
    OutOfMemory,
    /// Operation not supported for this buffer
    Unsupported,
}

impl Error {
    /// Errno value reported to user space for this error.
    ///
    /// `InvalidHandle` reports `EINVAL` like the host's handle lookup does,
    /// and `Unsupported` reports `ENOMEM` like the kernel-map path always has.
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument | Error::InvalidHandle => EINVAL,
            Error::Fault => EFAULT,
            Error::OutOfMemory | Error::Unsupported => ENOMEM,
        }
    }

    /// Negative errno, the ioctl return convention
    pub fn to_ret(self) -> isize {
        -(syscall::Error::new(self.errno()).errno as isize)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::InvalidHandle => write!(f, "Invalid handle"),
            Error::Fault => write!(f, "Bad user address"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Unsupported => write!(f, "Operation not supported"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidArgument.errno(), EINVAL);
        assert_eq!(Error::InvalidHandle.errno(), EINVAL);
        assert_eq!(Error::Fault.errno(), EFAULT);
        assert_eq!(Error::OutOfMemory.errno(), ENOMEM);
        assert_eq!(Error::Unsupported.errno(), ENOMEM);
    }

    #[test]
    fn test_ret_is_negative() {
        assert_eq!(Error::Fault.to_ret(), -(EFAULT as isize));
    }
}
