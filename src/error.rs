//! Status codes shared by the controller and node services.
//!
//! Component errors keep their own descriptive variants; [`Code`] is the
//! coarse classification surfaced to callers so they can decide whether a
//! retry is meaningful.

use std::fmt;

/// Outcome classification for a failed controller or node operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Code {
    /// Caller input was malformed or names an unsupported capability.
    InvalidArgument,
    /// A referenced remote object does not exist.
    NotFound,
    /// The remote object is in a state that conflicts with the request.
    FailedPrecondition,
    /// A concurrent transition prevented the operation; retry later.
    Aborted,
    /// A bounded wait expired before the remote resource converged.
    DeadlineExceeded,
    /// Unexpected remote, OS, or persistence failure.
    Internal,
    /// The capability is intentionally not supported.
    Unimplemented,
}

impl Code {
    /// Returns the canonical upper snake case name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Internal => "INTERNAL",
            Self::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
