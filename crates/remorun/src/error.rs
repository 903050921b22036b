//! # Errors
//!
//! `Error` is what an invocation returns to its caller. `Failure` is what an
//! exposed method returns when it cannot produce a value.

use std::any::Any;

use remorpc::ErrorEnvelope;
use remorpc::Fault;
use remorpc::Position;

use crate::registry::ObjectId;
use crate::transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// No listener at the port, or the host rejected the handshake.
    HostUnreachable(String),
    /// The connection closed while the call was in flight.
    ConnectionLost(String),
    /// The connection was already closed when the call was issued.
    ConnectionClosed,
    ObjectReleased(ObjectId),
    NotFound(ObjectId),
    SelectorNotSupported { selector: String, type_name: String },
    NotSerializable { position: Position, reason: String },
    ReentrantDeadlock,
    /// The remote method raised an application error.
    Remote(ErrorEnvelope),
    BadArguments(String),
    /// Only raised when a call timeout is configured.
    Timeout,
    Protocol(remorpc::Error),
    Transport(transport::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostUnreachable(msg) => write!(f, "Host unreachable: {}", msg),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ObjectReleased(id) => write!(f, "Object released: {}", id),
            Self::NotFound(id) => write!(f, "Object not found: {}", id),
            Self::SelectorNotSupported { selector, type_name } => {
                write!(f, "Selector '{}' not supported by {}", selector, type_name)
            }
            Self::NotSerializable { position, reason } => {
                write!(f, "Not serializable ({}): {}", position, reason)
            }
            Self::ReentrantDeadlock => write!(f, "Reentrant call into a serial context"),
            Self::Remote(envelope) => write!(f, "{}", envelope),
            Self::BadArguments(msg) => write!(f, "Bad arguments: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(envelope) => Some(envelope),
            Self::Protocol(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<remorpc::Error> for Error {
    fn from(e: remorpc::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::ObjectReleased(id) => Self::ObjectReleased(ObjectId(id)),
            Fault::NotFound(id) => Self::NotFound(ObjectId(id)),
            Fault::SelectorNotSupported { selector, type_name } => {
                Self::SelectorNotSupported { selector, type_name }
            }
            Fault::NotSerializable { position, reason } => Self::NotSerializable { position, reason },
            Fault::BadArguments(msg) => Self::BadArguments(msg),
            Fault::ReentrantDeadlock => Self::ReentrantDeadlock,
            Fault::Remote(envelope) => Self::Remote(envelope),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        failure.fault.into()
    }
}

impl Error {
    /// The fault to report to a remote caller for this error.
    pub(crate) fn into_fault(self) -> Fault {
        match self {
            Self::ObjectReleased(id) => Fault::ObjectReleased(id.0),
            Self::NotFound(id) => Fault::NotFound(id.0),
            Self::SelectorNotSupported { selector, type_name } => {
                Fault::SelectorNotSupported { selector, type_name }
            }
            Self::NotSerializable { position, reason } => Fault::NotSerializable { position, reason },
            Self::BadArguments(msg) => Fault::BadArguments(msg),
            Self::ReentrantDeadlock => Fault::ReentrantDeadlock,
            Self::Remote(envelope) => Fault::Remote(envelope),
            other => Fault::Remote(envelope_of(&other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by exposed methods.
///
/// Any `std::error::Error` converts into a `Failure` with `?`. The conversion
/// records the error's type name as the domain, its variant as the kind, its
/// `Display` text as the description and its `source()` chain as causes.
/// Errors from nested remote calls keep their original fault.
#[derive(Debug, Clone)]
pub struct Failure {
    fault: Fault,
}

impl Failure {
    pub fn new(domain: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self { fault: Fault::Remote(ErrorEnvelope::new(domain, kind, description)) }
    }

    /// Reports that the arguments did not fit the method.
    pub fn bad_arguments(msg: impl Into<String>) -> Self {
        Self { fault: Fault::BadArguments(msg.into()) }
    }

    /// The application error carried by this failure, if any.
    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match &self.fault {
            Fault::Remote(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub(crate) fn into_fault(self) -> Fault {
        self.fault
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fault)
    }
}

impl<E> From<E> for Failure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        if let Some(err) = (&e as &dyn Any).downcast_ref::<Error>() {
            return Self { fault: err.clone().into_fault() };
        }
        Self { fault: Fault::Remote(envelope_of(&e)) }
    }
}

/// Causes kept when an error is converted; deeper ones are dropped so the
/// envelope stays inside the codec's nesting limit.
pub(crate) const MAX_CAUSES: usize = 16;

fn envelope_of<E: std::error::Error + 'static>(e: &E) -> ErrorEnvelope {
    let mut envelope = ErrorEnvelope::new(std::any::type_name::<E>(), debug_kind(e), e.to_string());
    let mut causes = Vec::new();
    let mut source = e.source();
    while let Some(cause) = source {
        if causes.len() == MAX_CAUSES {
            break;
        }
        causes.push(ErrorEnvelope::new(debug_kind(cause), "", cause.to_string()));
        source = cause.source();
    }
    // innermost first, so each outer cause wraps the next
    let chain = causes.into_iter().rev().reduce(|inner, outer| outer.with_cause(inner));
    if let Some(chain) = chain {
        envelope = envelope.with_cause(chain);
    }
    envelope
}

/// Leading identifier of the `Debug` rendering, usually the variant name.
fn debug_kind(e: &(impl std::fmt::Debug + ?Sized)) -> String {
    format!("{:?}", e)
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}
