//! Error taxonomy for the node core (error handling design, see DESIGN.md).
//!
//! Every component-level crate defines its own narrow `Error` enum at its API
//! boundary and converts into this one where the boundary is crossed into
//! shared pipeline code. The mapping is intentionally coarse: callers that
//! need to distinguish, say, a sqlite busy-retry from a constraint violation
//! should match on the component's own error type before it gets here.

use std::fmt;

/// The taxonomy distinguished by the pipeline's error handling design.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Parse or validation of an incoming object failed. The object is
    /// silently dropped and the source connection is closed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// The object (or serial, or peer/object pair) was already known.
    /// Always a silent no-op, never surfaced to a caller as a failure.
    #[error("duplicate")]
    Duplicate,

    /// A submitted transaction violates a policy constraint. `expired`
    /// constraints are distinguished because the caller should regenerate
    /// rather than retry the same submission.
    #[error("constraint violation: {0}")]
    Constraint(Reason),

    /// The outcome of an operation could not be determined; the caller must
    /// not retry as though the original attempt is guaranteed lost.
    #[error("unknown outcome")]
    Unknown,

    /// A transport-level failure. The component's own retry policy (switch
    /// peer, switch round) applies; this variant only appears at the
    /// boundary where no further local recovery is possible.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A storage-level failure. The enclosing transaction has already been
    /// rolled back by the time this is returned.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// An unrecoverable invariant violation: guard-word corruption, a
    /// sequence counter overflow, or an allocation failure. The process is
    /// expected to log this and abort.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Distinguishes the one constraint reason the core spec calls out by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Expired,
    Other(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Expired => write!(f, "expired"),
            Reason::Other(s) => write!(f, "{s}"),
        }
    }
}

impl Error {
    /// True for errors that must never be retried blindly against the same
    /// input (the caller has to decide: drop, regenerate, or treat as lost).
    pub fn is_terminal_for_submitter(&self) -> bool {
        matches!(self, Error::InvalidObject(_) | Error::Constraint(_))
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_expired_is_terminal() {
        let e = Error::Constraint(Reason::Expired);
        assert!(e.is_terminal_for_submitter());
        assert_eq!(e.to_string(), "constraint violation: expired");
    }

    #[test]
    fn duplicate_is_not_terminal() {
        assert!(!Error::Duplicate.is_terminal_for_submitter());
    }
}
