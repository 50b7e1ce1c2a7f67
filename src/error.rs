//! Error types for bedrock
//!
//! Defines a unified error type that can represent errors from every layer:
//! the codec, the storage adapter, the table cache, and the procedure
//! runtime. Most variants carry enough context to log directly without a
//! wrapping caller adding detail.

use std::fmt;
use std::io;

/// Unified error type for bedrock operations
#[derive(Debug)]
pub enum Error {
    /// I/O error (storage file operations)
    Io(io::Error),
    /// Fewer bytes were available than a length/tag prefix declared
    MarshalUnderflow,
    /// A reserved tag, kind, or container flag was encountered while decoding
    MarshalBadFormat(String),
    /// A table API was called without the required record lock held
    LockViolation(String),
    /// A record was in the wrong save-state for the requested operation
    StateViolation(String),
    /// Sentinel caught by the procedure run loop: rollback and retry
    Redo,
    /// Sentinel caught by the procedure run loop: rollback, do not retry
    Undo,
    /// The procedure exhausted its redo budget
    RedoExhausted,
    /// The watchdog or a shutdown request interrupted the procedure
    Interrupted,
    /// The storage adapter reported a failure
    Storage(String),
    /// A session FIFO queue rejected a procedure (queue full)
    QueueFull,
    /// Generic internal error, used sparingly for conditions that should be unreachable
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::MarshalUnderflow => write!(f, "not enough bytes for declared length"),
            Error::MarshalBadFormat(msg) => write!(f, "bad record format: {}", msg),
            Error::LockViolation(msg) => write!(f, "lock violation: {}", msg),
            Error::StateViolation(msg) => write!(f, "state violation: {}", msg),
            Error::Redo => write!(f, "redo"),
            Error::Undo => write!(f, "undo"),
            Error::RedoExhausted => write!(f, "redo budget exhausted"),
            Error::Interrupted => write!(f, "procedure interrupted"),
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::QueueFull => write!(f, "session queue is full"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// True for the two control-flow sentinels that the procedure run loop
    /// must catch rather than propagate as ordinary failures.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Error::Redo | Error::Undo)
    }
}

/// Result type alias for bedrock operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_sentinels_are_identified() {
        assert!(Error::Redo.is_control_flow());
        assert!(Error::Undo.is_control_flow());
        assert!(!Error::RedoExhausted.is_control_flow());
        assert!(!Error::Interrupted.is_control_flow());
    }

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = vec![
            Error::Io(io::Error::new(io::ErrorKind::Other, "x")),
            Error::MarshalUnderflow,
            Error::MarshalBadFormat("bad tag".into()),
            Error::LockViolation("k".into()),
            Error::StateViolation("k".into()),
            Error::Redo,
            Error::Undo,
            Error::RedoExhausted,
            Error::Interrupted,
            Error::Storage("disk full".into()),
            Error::QueueFull,
            Error::Internal("unreachable".into()),
        ];
        for e in variants {
            assert!(!e.to_string().is_empty());
        }
    }
}
