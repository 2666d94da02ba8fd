#![allow(dead_code)]

use core::fmt;

/// Generic kernel-level errors shared by every subsystem (hotplug, cpufreq, core_ctl).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    NotFound,
    AlreadyExists,
    Invalid,
    PermissionDenied,
    NoMemory,
    Busy,
    NotSupported,
    IO,
    WouldBlock,
    OutOfRange,
    Timeout,
}

impl KError {
    /// Negative errno a sysfs-style write would hand back to userspace.
    pub fn errno(&self) -> i32 {
        match self {
            KError::NotFound => -2,          // ENOENT
            KError::AlreadyExists => -17,    // EEXIST
            KError::Invalid => -22,          // EINVAL
            KError::PermissionDenied => -13, // EACCES
            KError::NoMemory => -12,         // ENOMEM
            KError::Busy => -16,             // EBUSY
            KError::NotSupported => -95,     // EOPNOTSUPP
            KError::IO => -5,                // EIO
            KError::WouldBlock => -11,       // EAGAIN
            KError::OutOfRange => -34,       // ERANGE
            KError::Timeout => -110,         // ETIMEDOUT
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KError::NotFound => "not found",
            KError::AlreadyExists => "already exists",
            KError::Invalid => "invalid argument",
            KError::PermissionDenied => "permission denied",
            KError::NoMemory => "out of memory",
            KError::Busy => "device or resource busy",
            KError::NotSupported => "operation not supported",
            KError::IO => "I/O error",
            KError::WouldBlock => "operation would block",
            KError::OutOfRange => "result out of range",
            KError::Timeout => "timed out",
        }
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for KError {}

pub type KResult<T> = core::result::Result<T, KError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KError::Invalid.errno(), -22);
        assert_eq!(KError::OutOfRange.errno(), -34);
        assert_eq!(KError::Busy.errno(), -16);
    }

    #[test]
    fn test_display() {
        assert_eq!(KError::Invalid.to_string(), "invalid argument");
    }
}
