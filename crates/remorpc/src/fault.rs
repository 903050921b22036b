//! # Faults
//!
//! The "Err" side of a Reply. A `Fault` is the remote system reporting that an
//! invocation did not produce a value; it is distinct from `Error`, which
//! reports that the bytes themselves could not be handled.

use crate::error::Error;
use crate::error::Result;
use crate::value::MAX_RECURSION_DEPTH;

use remopack::Decoder;
use remopack::Encoder;

/// Where a value that failed to marshal was positioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Zero-based argument index.
    Argument(usize),
    ReturnValue,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Argument(i) => write!(f, "argument {}", i),
            Position::ReturnValue => write!(f, "return value"),
        }
    }
}

/// A transportable description of an application error.
///
/// The original error type does not survive the trip; its domain (type name),
/// kind (variant) and description do, along with the chain of causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub domain: String,
    pub kind: String,
    pub description: String,
    pub cause: Option<Box<ErrorEnvelope>>,
}

impl ErrorEnvelope {
    pub fn new(domain: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            kind: kind.into(),
            description: description.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorEnvelope) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The description supplied by the raising side, verbatim.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The description, or a generic sentence naming domain and kind when none was given.
    pub fn localized_description(&self) -> String {
        if self.description.is_empty() {
            format!("The operation couldn't be completed. ({} error {}.)", self.domain, self.kind)
        } else {
            self.description.clone()
        }
    }

    /// Iterates this envelope followed by each cause.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorEnvelope> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.kind.is_empty() {
            write!(f, "{}: {}", self.domain, self.localized_description())
        } else {
            write!(f, "{}.{}: {}", self.domain, self.kind, self.localized_description())
        }
    }
}

impl std::error::Error for ErrorEnvelope {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Reasons an invocation failed on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The target identity was exposed once and has since been released.
    ObjectReleased(u64),
    /// The target identity was never issued by the remote registry.
    NotFound(u64),
    /// The target exists but has no capability for the selector.
    SelectorNotSupported { selector: String, type_name: String },
    /// A value could not be encoded for transport.
    NotSerializable { position: Position, reason: String },
    /// Arguments did not match the declared parameter shapes.
    BadArguments(String),
    /// The request re-entered a serial context that rejects reentry.
    ReentrantDeadlock,
    /// The invoked method raised an application error.
    Remote(ErrorEnvelope),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::ObjectReleased(id) => write!(f, "object {} has been released", id),
            Fault::NotFound(id) => write!(f, "object {} not found", id),
            Fault::SelectorNotSupported { selector, type_name } => {
                write!(f, "{} does not respond to selector '{}'", type_name, selector)
            }
            Fault::NotSerializable { position, reason } => {
                write!(f, "{} is not serializable: {}", position, reason)
            }
            Fault::BadArguments(msg) => write!(f, "bad arguments: {}", msg),
            Fault::ReentrantDeadlock => write!(f, "reentrant call into a serial context"),
            Fault::Remote(envelope) => write!(f, "{}", envelope),
        }
    }
}

pub(crate) fn encode_fault(enc: &mut Encoder, fault: &Fault) -> Result<()> {
    match fault {
        Fault::ObjectReleased(id) => enc.entry("ObjectReleased", |e| e.u64(*id))?,
        Fault::NotFound(id) => enc.entry("NotFound", |e| e.u64(*id))?,
        Fault::SelectorNotSupported { selector, type_name } => {
            enc.variant_begin("SelectorNotSupported")?;
            enc.map_begin()?;
            enc.entry("selector", |e| e.str(selector))?;
            enc.entry("type_name", |e| e.str(type_name))?;
            enc.map_end()?;
            enc.variant_end()?;
        }
        Fault::NotSerializable { position, reason } => {
            enc.variant_begin("NotSerializable")?;
            enc.map_begin()?;
            enc.entry("position", |e| match position {
                Position::Argument(i) => e.entry("Argument", |e| e.u64(*i as u64)),
                Position::ReturnValue => e.entry("ReturnValue", |e| e.unit()),
            })?;
            enc.entry("reason", |e| e.str(reason))?;
            enc.map_end()?;
            enc.variant_end()?;
        }
        Fault::BadArguments(msg) => enc.entry("BadArguments", |e| e.str(msg))?,
        Fault::ReentrantDeadlock => enc.entry("ReentrantDeadlock", |e| e.unit())?,
        Fault::Remote(envelope) => {
            enc.variant_begin("Remote")?;
            encode_envelope(enc, envelope, 0)?;
            enc.variant_end()?;
        }
    }
    Ok(())
}

fn encode_envelope(enc: &mut Encoder, envelope: &ErrorEnvelope, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }
    enc.map_begin()?;
    enc.entry("domain", |e| e.str(&envelope.domain))?;
    enc.entry("kind", |e| e.str(&envelope.kind))?;
    enc.entry("description", |e| e.str(&envelope.description))?;
    if let Some(cause) = &envelope.cause {
        enc.variant_begin("cause")?;
        encode_envelope(enc, cause, depth + 1)?;
        enc.variant_end()?;
    }
    enc.map_end()?;
    Ok(())
}

pub(crate) fn decode_fault(dec: &mut Decoder) -> Result<Fault> {
    let (tag, mut body) = dec.variant()?;
    let fault = match tag {
        "ObjectReleased" => Fault::ObjectReleased(body.u64()?),
        "NotFound" => Fault::NotFound(body.u64()?),
        "SelectorNotSupported" => {
            let mut map = body.map()?;
            let mut selector = None;
            let mut type_name = None;
            while let Some((key, mut val)) = map.next()? {
                match key {
                    "selector" => selector = Some(val.str()?.to_string()),
                    "type_name" => type_name = Some(val.str()?.to_string()),
                    _ => val.skip()?,
                }
            }
            Fault::SelectorNotSupported {
                selector: selector.ok_or(Error::ProtocolViolation("Missing selector".into()))?,
                type_name: type_name.ok_or(Error::ProtocolViolation("Missing type_name".into()))?,
            }
        }
        "NotSerializable" => {
            let mut map = body.map()?;
            let mut position = None;
            let mut reason = None;
            while let Some((key, mut val)) = map.next()? {
                match key {
                    "position" => {
                        let (side, mut payload) = val.variant()?;
                        position = Some(match side {
                            "Argument" => Position::Argument(payload.u64()? as usize),
                            "ReturnValue" => {
                                payload.unit()?;
                                Position::ReturnValue
                            }
                            other => return Err(Error::UnknownVariant(format!("Position: {}", other))),
                        });
                    }
                    "reason" => reason = Some(val.str()?.to_string()),
                    _ => val.skip()?,
                }
            }
            Fault::NotSerializable {
                position: position.ok_or(Error::ProtocolViolation("Missing position".into()))?,
                reason: reason.unwrap_or_default(),
            }
        }
        "BadArguments" => Fault::BadArguments(body.str()?.to_string()),
        "ReentrantDeadlock" => {
            body.unit()?;
            Fault::ReentrantDeadlock
        }
        "Remote" => Fault::Remote(decode_envelope(&mut body, 0)?),
        other => return Err(Error::UnknownVariant(format!("Fault: {}", other))),
    };
    Ok(fault)
}

fn decode_envelope(dec: &mut Decoder, depth: usize) -> Result<ErrorEnvelope> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }
    let mut map = dec.map()?;
    let mut envelope = ErrorEnvelope::new("", "", "");
    while let Some((key, mut val)) = map.next()? {
        match key {
            "domain" => envelope.domain = val.str()?.to_string(),
            "kind" => envelope.kind = val.str()?.to_string(),
            "description" => envelope.description = val.str()?.to_string(),
            "cause" => envelope.cause = Some(Box::new(decode_envelope(&mut val, depth + 1)?)),
            _ => val.skip()?,
        }
    }
    Ok(envelope)
}
