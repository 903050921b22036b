//! # Error Definitions
//!
//! Failures of the wire protocol itself: malformed bytes, type mismatches
//! and structural violations. Remote application failures live in `Fault`.

use remopack::Error as PackError;

/// Operational failures within the RPC mechanism itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying remopack serialization failed.
    Serialization(PackError),
    /// The wire value did not match the expected shape.
    TypeMismatch { expected: String, found: String },
    /// An argument list had the wrong number of entries.
    ArgumentCount { expected: usize, found: usize },
    /// An argument failed to decode; `index` is zero-based.
    Argument { index: usize, reason: Box<Error> },
    /// An unknown enum variant or top-level frame type was encountered.
    UnknownVariant(String),
    /// The internal structure of the message was malformed.
    ProtocolViolation(String),
    /// The nested depth of a value exceeded the safety limit.
    RecursionLimitExceeded,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Serialization(e) => write!(f, "serialization failed: {}", e),
            Error::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            Error::ArgumentCount { expected, found } => {
                write!(f, "expected {} arguments, found {}", expected, found)
            }
            Error::Argument { index, reason } => write!(f, "argument {}: {}", index, reason),
            Error::UnknownVariant(v) => write!(f, "unknown variant: {}", v),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::RecursionLimitExceeded => write!(f, "value nesting exceeds recursion limit"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serialization(e) => Some(e),
            Error::Argument { reason, .. } => Some(reason.as_ref()),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
