//! Error classification shared by every subsystem.
//!
//! Each subsystem has its own error enum; [`ErrorKind`] is the coarse
//! classification a protocol front-end translates into responses.

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Path resolution or lookup miss.
    NotExist,
    /// Duplicate identity, share or file.
    AlreadyExists,
    /// Operation not allowed on this target (sandbox root, rename onto itself).
    InvalidOperation,
    /// Action disallowed by the identity's flags.
    PermissionDenied,
    /// External converter failed or could not be launched.
    ConversionFailed,
    /// Anything else (I/O, poisoned locks, serialization).
    Internal,
}

impl ErrorKind {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal | Self::ConversionFailed)
    }
}
