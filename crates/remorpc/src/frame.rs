//! # Protocol Frames
//!
//! Defines every message exchanged on a connection: the handshake
//! (`Hello`, `Welcome`, `Reject`), invocations (`Call`, `Reply`) and
//! distributed reference counting (`Release`).
//!
//! Decoding never panics on malformed input, and fields a reader does not
//! know are skipped. Call arguments and reply values stay encoded until the
//! receiver knows which shapes to decode them against.

use crate::error::Error;
use crate::error::Result;
use crate::fault::Fault;
use crate::fault::decode_fault;
use crate::fault::encode_fault;
use crate::value::Shape;
use crate::value::WireValue;
use crate::value::encode_args;
use crate::value::from_bytes;
use crate::value::decode_args;
use crate::value::to_bytes;

use remopack::Decoder;
use remopack::Encoder;

/// Version carried in the handshake; peers with a different version are rejected.
pub const PROTOCOL_VERSION: u64 = 1;

/// First frame sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u64,
    /// Random tag of the client's registry.
    pub registry: u64,
    pub name: Option<String>,
    pub device: Option<String>,
}

/// An outbound or inbound invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub seq: u64,
    pub target: u64,
    pub selector: String,
    /// Ids of serial work contexts suspended on this logical call.
    pub chain: Vec<u64>,
    /// Encoded argument list; see `Call::args`.
    pub args: Vec<u8>,
}

impl Call {
    pub fn new(seq: u64, target: u64, selector: impl Into<String>, chain: Vec<u64>, args: &[WireValue]) -> Result<Self> {
        Ok(Self {
            seq,
            target,
            selector: selector.into(),
            chain,
            args: encode_args(args)?,
        })
    }

    /// Decodes the arguments, checking them against `shapes` when declared.
    pub fn args(&self, shapes: Option<&[Shape]>) -> Result<Vec<WireValue>> {
        decode_args(&self.args, shapes)
    }
}

/// The outcome of a `Call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    /// - `Ok(bytes)`: one encoded value.
    /// - `Err(Fault)`: the invocation failed remotely.
    pub status: std::result::Result<Vec<u8>, Fault>,
}

impl Reply {
    pub fn ok(seq: u64, value: &WireValue) -> Result<Self> {
        Ok(Self { seq, status: Ok(to_bytes(value)?) })
    }

    pub fn fault(seq: u64, fault: Fault) -> Self {
        Self { seq, status: Err(fault) }
    }

    /// Decodes the returned value or hands back the fault.
    pub fn value(&self, shape: &Shape) -> Result<std::result::Result<WireValue, Fault>> {
        match &self.status {
            Ok(bytes) => Ok(Ok(from_bytes(bytes, shape)?)),
            Err(fault) => Ok(Err(fault.clone())),
        }
    }
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Welcome { version: u64, registry: u64 },
    Reject { reason: String },
    Call(Call),
    Reply(Reply),
    /// The sender dropped `count` received references to `id`.
    Release { id: u64, count: u64 },
}

impl Frame {
    /// Name of the frame kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "Hello",
            Frame::Welcome { .. } => "Welcome",
            Frame::Reject { .. } => "Reject",
            Frame::Call(_) => "Call",
            Frame::Reply(_) => "Reply",
            Frame::Release { .. } => "Release",
        }
    }

    /// Encodes this frame into a standalone buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    /// Encodes this frame into the encoder.
    pub fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(self.kind())?;
        match self {
            Frame::Hello(hello) => {
                enc.map_begin()?;
                enc.entry("version", |e| e.u64(hello.version))?;
                enc.entry("registry", |e| e.u64(hello.registry))?;
                enc.entry("name", |e| write_opt_str(e, hello.name.as_deref()))?;
                enc.entry("device", |e| write_opt_str(e, hello.device.as_deref()))?;
                enc.map_end()?;
            }
            Frame::Welcome { version, registry } => {
                enc.map_begin()?;
                enc.entry("version", |e| e.u64(*version))?;
                enc.entry("registry", |e| e.u64(*registry))?;
                enc.map_end()?;
            }
            Frame::Reject { reason } => {
                enc.map_begin()?;
                enc.entry("reason", |e| e.str(reason))?;
                enc.map_end()?;
            }
            Frame::Call(call) => {
                enc.map_begin()?;
                enc.entry("seq", |e| e.u64(call.seq))?;
                enc.entry("target", |e| e.u64(call.target))?;
                enc.entry("selector", |e| e.str(&call.selector))?;
                enc.variant_begin("chain")?;
                enc.list_begin()?;
                for ctx in &call.chain {
                    enc.u64(*ctx)?;
                }
                enc.list_end()?;
                enc.variant_end()?;
                enc.entry("args", |e| e.item(&call.args))?;
                enc.map_end()?;
            }
            Frame::Reply(reply) => match &reply.status {
                Ok(value) => {
                    enc.result_ok_begin()?;
                    enc.map_begin()?;
                    enc.entry("seq", |e| e.u64(reply.seq))?;
                    enc.entry("value", |e| e.item(value))?;
                    enc.map_end()?;
                    enc.result_ok_end()?;
                }
                Err(fault) => {
                    enc.result_err_begin()?;
                    enc.map_begin()?;
                    enc.entry("seq", |e| e.u64(reply.seq))?;
                    enc.variant_begin("fault")?;
                    encode_fault(enc, fault)?;
                    enc.variant_end()?;
                    enc.map_end()?;
                    enc.result_err_end()?;
                }
            },
            Frame::Release { id, count } => {
                enc.map_begin()?;
                enc.entry("id", |e| e.u64(*id))?;
                enc.entry("count", |e| e.u64(*count))?;
                enc.map_end()?;
            }
        }
        enc.variant_end()?;
        Ok(())
    }

    /// Decodes a frame from a standalone buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let frame = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(frame)
    }

    /// Decodes one frame from the decoder.
    pub fn decode_from(dec: &mut Decoder) -> Result<Self> {
        let (kind, mut body) = dec.variant()?;
        match kind {
            "Hello" => {
                let mut map = body.map()?;
                let mut version = None;
                let mut registry = None;
                let mut name = None;
                let mut device = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "version" => version = Some(val.u64()?),
                        "registry" => registry = Some(val.u64()?),
                        "name" => name = read_opt_str(&mut val)?,
                        "device" => device = read_opt_str(&mut val)?,
                        _ => val.skip()?,
                    }
                }
                Ok(Frame::Hello(Hello {
                    version: version.ok_or_else(|| missing("version"))?,
                    registry: registry.ok_or_else(|| missing("registry"))?,
                    name,
                    device,
                }))
            }
            "Welcome" => {
                let mut map = body.map()?;
                let mut version = None;
                let mut registry = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "version" => version = Some(val.u64()?),
                        "registry" => registry = Some(val.u64()?),
                        _ => val.skip()?,
                    }
                }
                Ok(Frame::Welcome {
                    version: version.ok_or_else(|| missing("version"))?,
                    registry: registry.ok_or_else(|| missing("registry"))?,
                })
            }
            "Reject" => {
                let mut map = body.map()?;
                let mut reason = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "reason" => reason = Some(val.str()?.to_string()),
                        _ => val.skip()?,
                    }
                }
                Ok(Frame::Reject { reason: reason.unwrap_or_default() })
            }
            "Call" => Ok(Frame::Call(decode_call(body)?)),
            "Reply" => Ok(Frame::Reply(decode_reply(body)?)),
            "Release" => {
                let mut map = body.map()?;
                let mut id = None;
                let mut count = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "id" => id = Some(val.u64()?),
                        "count" => count = Some(val.u64()?),
                        _ => val.skip()?,
                    }
                }
                Ok(Frame::Release {
                    id: id.ok_or_else(|| missing("id"))?,
                    count: count.unwrap_or(1),
                })
            }
            _ => Err(Error::UnknownVariant(format!("frame {}", kind))),
        }
    }
}

fn decode_call(mut dec: Decoder) -> Result<Call> {
    let mut map = dec.map()?;
    let mut seq = None;
    let mut target = None;
    let mut selector = None;
    let mut chain = Vec::new();
    let mut args = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "seq" => seq = Some(val.u64()?),
            "target" => target = Some(val.u64()?),
            "selector" => selector = Some(val.str()?.to_string()),
            "chain" => {
                let mut list = val.list()?;
                while let Some(mut ctx) = list.next()? {
                    chain.push(ctx.u64()?);
                }
            }
            "args" => args = Some(val.as_slice().to_vec()),
            _ => val.skip()?,
        }
    }

    Ok(Call {
        seq: seq.ok_or_else(|| missing("seq"))?,
        target: target.ok_or_else(|| missing("target"))?,
        selector: selector.ok_or_else(|| missing("selector"))?,
        chain,
        args: args.ok_or_else(|| missing("args"))?,
    })
}

fn decode_reply(mut dec: Decoder) -> Result<Reply> {
    let (mut body, is_ok) = match dec.result()? {
        Ok(ok_body) => (ok_body, true),
        Err(err_body) => (err_body, false),
    };
    let mut map = body.map()?;
    let mut seq = None;
    let mut value = None;
    let mut fault = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "seq" => seq = Some(val.u64()?),
            "value" if is_ok => value = Some(val.as_slice().to_vec()),
            "fault" if !is_ok => fault = Some(decode_fault(&mut val)?),
            _ => val.skip()?,
        }
    }

    let seq = seq.ok_or_else(|| missing("seq"))?;
    let status = if is_ok {
        Ok(value.ok_or_else(|| missing("value"))?)
    } else {
        Err(fault.ok_or_else(|| missing("fault"))?)
    };
    Ok(Reply { seq, status })
}

/// Returns the top-level frame name without decoding the body.
pub fn peek_kind(bytes: &[u8]) -> Result<&str> {
    let mut dec = Decoder::new(bytes);
    let (kind, _) = dec.variant()?;
    Ok(kind)
}

/// Reads only the `seq` field of a Call or Reply, so a frame whose body fails
/// to decode can still be answered or matched to its caller.
pub fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let mut dec = Decoder::new(bytes);
    let (kind, mut body) = dec.variant()?;
    let mut map = match kind {
        "Call" => body.map()?,
        "Reply" => match body.result()? {
            Ok(mut ok_body) => ok_body.map()?,
            Err(mut err_body) => err_body.map()?,
        },
        _ => return Err(Error::UnknownVariant(format!("frame {}", kind))),
    };

    while let Some((key, mut val)) = map.next()? {
        if key == "seq" {
            return Ok(val.u64()?);
        }
        val.skip()?;
    }

    Err(missing("seq"))
}

fn missing(field: &str) -> Error {
    Error::ProtocolViolation(format!("missing field '{}'", field))
}

fn write_opt_str(enc: &mut Encoder, val: Option<&str>) -> remopack::Result<()> {
    match val {
        Some(s) => {
            enc.option_some_begin()?;
            enc.str(s)?;
            enc.option_some_end()
        }
        None => enc.option_none(),
    }
}

fn read_opt_str(dec: &mut Decoder) -> Result<Option<String>> {
    match dec.option()? {
        Some(mut inner) => Ok(Some(inner.str()?.to_string())),
        None => Ok(None),
    }
}
