//! # Wire Values
//!
//! The translation layer between `WireValue` and the remopack byte format.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Shape Strictness**: Decoding verifies wire tags against the expected `Shape`.
//! - **No addresses**: object references are `(registry, id)` pairs only.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::error::Result;

use remopack::Decoder;
use remopack::Encoder;
use remopack::Tag;

/// The maximum nesting depth for values before decoding fails.
pub const MAX_RECURSION_DEPTH: usize = 64;

/// Variant name that marks a structured value encoded under a serialization contract.
const CODED_VARIANT: &str = "$coded";

/// A reference to an object living in some registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Random tag of the registry that owns the object.
    pub registry: u64,
    pub id: u64,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ref-{:016x}/{}", self.registry, self.id)
    }
}

/// A value as it travels between processes.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Unit,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    /// A structured value: its contract type name plus its serialized body.
    Coded { type_name: String, data: Vec<u8> },
    Ref(ObjectRef),
}

impl WireValue {
    /// Short name of the value's kind, used in mismatch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Unit => "unit",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::UInt(_) => "uint",
            WireValue::Float(_) => "float",
            WireValue::Str(_) => "string",
            WireValue::Bytes(_) => "bytes",
            WireValue::List(_) => "list",
            WireValue::Map(_) => "map",
            WireValue::Coded { .. } => "coded",
            WireValue::Ref(_) => "object",
        }
    }
}

/// The expected form of a value, declared per parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Accept whatever arrives.
    Any,
    Unit,
    Bool,
    /// Signed integer; unsigned values that fit are accepted.
    Int,
    Float,
    Str,
    Bytes,
    List(Box<Shape>),
    /// String-keyed map whose values all match the inner shape.
    Map(Box<Shape>),
    /// A structured value with the given contract type name.
    Coded(String),
    /// A reference to a remote or local object.
    Object,
}

impl Shape {
    pub fn list(inner: Shape) -> Self { Shape::List(Box::new(inner)) }
    pub fn map(inner: Shape) -> Self { Shape::Map(Box::new(inner)) }
    pub fn coded(type_name: impl Into<String>) -> Self { Shape::Coded(type_name.into()) }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shape::Any => write!(f, "any"),
            Shape::Unit => write!(f, "unit"),
            Shape::Bool => write!(f, "bool"),
            Shape::Int => write!(f, "int"),
            Shape::Float => write!(f, "float"),
            Shape::Str => write!(f, "string"),
            Shape::Bytes => write!(f, "bytes"),
            Shape::List(inner) => write!(f, "list<{}>", inner),
            Shape::Map(inner) => write!(f, "map<{}>", inner),
            Shape::Coded(name) => write!(f, "coded<{}>", name),
            Shape::Object => write!(f, "object"),
        }
    }
}

/// Encodes a value into the encoder stream.
///
/// # Errors
/// Returns `Error::RecursionLimitExceeded` if the value is too deeply nested.
pub fn encode_value(enc: &mut Encoder, val: &WireValue) -> Result<()> {
    encode_value_impl(enc, val, 0)
}

fn encode_value_impl(enc: &mut Encoder, val: &WireValue, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    match val {
        WireValue::Unit => enc.unit()?,
        WireValue::Bool(b) => enc.bool(*b)?,
        WireValue::Int(v) => enc.s64(*v)?,
        WireValue::UInt(v) => enc.u64(*v)?,
        WireValue::Float(v) => enc.f64(*v)?,
        WireValue::Str(s) => enc.str(s)?,
        WireValue::Bytes(b) => enc.bytes(b)?,
        WireValue::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        WireValue::Map(entries) => {
            enc.map_begin()?;
            for (key, value) in entries {
                enc.variant_begin(key)?;
                encode_value_impl(enc, value, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
        }
        WireValue::Coded { type_name, data } => {
            enc.variant_begin(CODED_VARIANT)?;
            enc.list_begin()?;
            enc.str(type_name)?;
            enc.bytes(data)?;
            enc.list_end()?;
            enc.variant_end()?;
        }
        WireValue::Ref(r) => enc.object_ref(r.registry, r.id)?,
    }
    Ok(())
}

/// Decodes a single value, checking it against `shape`.
pub fn decode_value(dec: &mut Decoder, shape: &Shape) -> Result<WireValue> {
    decode_value_impl(dec, shape, 0)
}

fn decode_value_impl(dec: &mut Decoder, shape: &Shape, depth: usize) -> Result<WireValue> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    let tag = dec.peek_tag()?;
    let value = match (shape, tag) {
        (Shape::Any | Shape::Unit, Tag::Unit) => {
            dec.unit()?;
            WireValue::Unit
        }
        (Shape::Any | Shape::Bool, Tag::BoolTrue | Tag::BoolFalse) => WireValue::Bool(dec.bool()?),
        (Shape::Any | Shape::Int, Tag::S64) => WireValue::Int(dec.s64()?),
        (Shape::Any, Tag::U64) => WireValue::UInt(dec.u64()?),
        (Shape::Int, Tag::U64) => {
            let v = dec.u64()?;
            let v = i64::try_from(v).map_err(|_| Error::TypeMismatch {
                expected: shape.to_string(),
                found: format!("uint {}", v),
            })?;
            WireValue::Int(v)
        }
        (Shape::Any | Shape::Float, Tag::F64) => WireValue::Float(dec.f64()?),
        (Shape::Any | Shape::Str, Tag::String) => WireValue::Str(dec.str()?.to_string()),
        (Shape::Any | Shape::Bytes, Tag::Bytes) => WireValue::Bytes(dec.bytes()?.to_vec()),
        (Shape::Any | Shape::List(_), Tag::List) => {
            let inner = match shape {
                Shape::List(inner) => inner.as_ref(),
                _ => &Shape::Any,
            };
            let mut list = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = list.next()? {
                items.push(decode_value_impl(&mut item, inner, depth + 1)?);
            }
            WireValue::List(items)
        }
        (Shape::Any | Shape::Map(_), Tag::Map) => {
            let inner = match shape {
                Shape::Map(inner) => inner.as_ref(),
                _ => &Shape::Any,
            };
            let mut map = dec.map()?;
            let mut entries = BTreeMap::new();
            while let Some((key, mut value)) = map.next()? {
                entries.insert(key.to_string(), decode_value_impl(&mut value, inner, depth + 1)?);
            }
            WireValue::Map(entries)
        }
        (Shape::Any | Shape::Coded(_), Tag::Variant) => {
            let (name, mut body) = dec.variant()?;
            if name != CODED_VARIANT {
                return Err(Error::UnknownVariant(name.to_string()));
            }
            let mut parts = body.list()?;
            let type_name = match parts.next()? {
                Some(mut d) => d.str()?.to_string(),
                None => return Err(Error::ProtocolViolation("coded value missing type name".into())),
            };
            let data = match parts.next()? {
                Some(mut d) => d.bytes()?.to_vec(),
                None => return Err(Error::ProtocolViolation("coded value missing body".into())),
            };
            if let Shape::Coded(expected) = shape {
                if *expected != type_name {
                    return Err(Error::TypeMismatch {
                        expected: shape.to_string(),
                        found: format!("coded<{}>", type_name),
                    });
                }
            }
            WireValue::Coded { type_name, data }
        }
        (Shape::Any | Shape::Object, Tag::Ref) => {
            let (registry, id) = dec.object_ref()?;
            WireValue::Ref(ObjectRef { registry, id })
        }
        (_, found) => {
            return Err(Error::TypeMismatch {
                expected: shape.to_string(),
                found: format!("{:?}", found),
            });
        }
    };
    Ok(value)
}

/// Encodes one value into a standalone buffer.
pub fn to_bytes(val: &WireValue) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_value(&mut enc, val)?;
    Ok(enc.into_bytes()?)
}

/// Decodes one value from a standalone buffer; trailing bytes are an error.
pub fn from_bytes(bytes: &[u8], shape: &Shape) -> Result<WireValue> {
    let mut dec = Decoder::new(bytes);
    let val = decode_value(&mut dec, shape)?;
    dec.finish()?;
    Ok(val)
}

/// Encodes an argument list.
pub fn encode_args(args: &[WireValue]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    for arg in args {
        encode_value(&mut enc, arg)?;
    }
    enc.list_end()?;
    Ok(enc.into_bytes()?)
}

/// Decodes an argument list, checking each entry against `shapes` when given.
pub fn decode_args(bytes: &[u8], shapes: Option<&[Shape]>) -> Result<Vec<WireValue>> {
    let mut dec = Decoder::new(bytes);
    let mut list = dec.list()?;
    dec.finish()?;

    let mut args = Vec::new();
    while let Some(mut item) = list.next()? {
        let index = args.len();
        let shape = match shapes {
            Some(shapes) => shapes.get(index).unwrap_or(&Shape::Any),
            None => &Shape::Any,
        };
        let arg = decode_value(&mut item, shape)
            .map_err(|e| Error::Argument { index, reason: Box::new(e) })?;
        args.push(arg);
    }

    if let Some(shapes) = shapes {
        if shapes.len() != args.len() {
            return Err(Error::ArgumentCount { expected: shapes.len(), found: args.len() });
        }
    }
    Ok(args)
}
