//! # Values
//!
//! `Value` is what methods take and return. Plain variants are copied across
//! the boundary; `Object` travels as a reference unless wrapped in `ByValue`.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use remorpc::Shape;

use crate::error::Failure;
use crate::object::Callback;
use crate::object::Invocable;
use crate::object::Object;
use crate::proxy::RemoteProxy;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Coded(Coded),
    Object(Object),
    /// Ask for a snapshot of the wrapped object instead of a reference.
    ByValue(Box<Value>),
}

impl Value {
    /// Encodes `value` under its serde contract.
    pub fn coded<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Value::Coded(Coded::new(value)?))
    }

    /// Wraps a closure as a callback object; it travels by reference and is
    /// invoked with the `call` selector.
    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        Value::Object(Object::local(Callback::new(f)))
    }

    pub fn object(object: impl Invocable) -> Self {
        Value::Object(Object::local(object))
    }

    pub fn by_value(value: impl Into<Value>) -> Self {
        Value::ByValue(Box::new(value.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Coded(_) => "coded",
            Value::Object(_) => "object",
            Value::ByValue(_) => "by-value",
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// A structured value carried as its serialized form plus a contract name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coded {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl Coded {
    pub fn new<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self {
            type_name: contract_name::<T>().to_string(),
            data: serde_json::to_vec(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }
}

/// The unqualified type name both sides agree on, e.g. `Point` for `app::geo::Point`.
pub fn contract_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// The positional arguments of an invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Converts argument `index`, failing the invocation with `BadArguments`.
    pub fn arg<T: FromValue>(&self, index: usize) -> Result<T, Failure> {
        let Some(value) = self.0.get(index) else {
            return Err(Failure::bad_arguments(format!("missing argument {}", index)));
        };
        T::from_value(value.clone()).ok_or_else(|| {
            Failure::bad_arguments(format!(
                "argument {}: expected {}, found {}",
                index,
                T::shape(),
                value.kind()
            ))
        })
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Typed extraction from a `Value`.
pub trait FromValue: Sized {
    /// The shape this type accepts, for mismatch reports.
    fn shape() -> Shape;
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for Value {
    fn shape() -> Shape { Shape::Any }
    fn from_value(value: Value) -> Option<Self> { Some(value) }
}

impl FromValue for () {
    fn shape() -> Shape { Shape::Unit }
    fn from_value(value: Value) -> Option<Self> {
        matches!(value, Value::Unit).then_some(())
    }
}

impl FromValue for bool {
    fn shape() -> Shape { Shape::Bool }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn shape() -> Shape { Shape::Int }
    fn from_value(value: Value) -> Option<Self> { value.as_i64() }
}

impl FromValue for i32 {
    fn shape() -> Shape { Shape::Int }
    fn from_value(value: Value) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }
}

impl FromValue for u64 {
    fn shape() -> Shape { Shape::Int }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::UInt(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn shape() -> Shape { Shape::Float }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn shape() -> Shape { Shape::Str }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl FromValue for Coded {
    fn shape() -> Shape { Shape::coded("*") }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Coded(c) => Some(c),
            _ => None,
        }
    }
}

impl FromValue for Object {
    fn shape() -> Shape { Shape::Object }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl FromValue for RemoteProxy {
    fn shape() -> Shape { Shape::Object }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(Object::Remote(p)) => Some(p),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn shape() -> Shape { Shape::list(T::shape()) }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn shape() -> Shape { Shape::map(T::shape()) }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self { Value::Unit }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::UInt(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}

impl From<Coded> for Value {
    fn from(v: Coded) -> Self { Value::Coded(v) }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self { Value::Object(v) }
}

impl From<RemoteProxy> for Value {
    fn from(v: RemoteProxy) -> Self { Value::Object(Object::Remote(v)) }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
