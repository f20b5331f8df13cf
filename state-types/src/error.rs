//! Error classification shared by every zstate crate.

use std::fmt;

/// Coarse category of a failure.
///
/// Each crate keeps its own error enum; `kind()` on those maps them here so
/// callers can decide on a fallback without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Requested state or record is absent. Recoverable.
    NotFound,
    /// Malformed input such as an undecodable state blob. Fatal to the session.
    InvalidInput,
    /// The persistence backend rejected a write.
    WriteFailed,
    /// A backend is unreachable; degrade instead of failing.
    Unavailable,
    /// The user or device is not authorized.
    PermissionDenied,
    /// Setup or bootstrap failure; no degraded mode exists.
    Configuration,
}

impl ErrorKind {
    /// True when retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::InvalidInput => "invalid input",
            Self::WriteFailed => "write failed",
            Self::Unavailable => "unavailable",
            Self::PermissionDenied => "permission denied",
            Self::Configuration => "configuration error",
        };
        f.write_str(name)
    }
}
