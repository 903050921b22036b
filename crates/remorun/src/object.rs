//! # Objects
//!
//! Exposed objects declare their selectors in a capability table instead of
//! relying on reflection. `ObjectBuilder` assembles such a table from closures.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::FutureExt;

use remorpc::Shape;

use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::proxy::RemoteProxy;
use crate::value::Args;
use crate::value::Value;

/// What a selector accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capability {
    /// Declared parameter shapes; `None` accepts any arguments.
    pub params: Option<Vec<Shape>>,
}

impl Capability {
    pub fn any() -> Self {
        Self { params: None }
    }

    pub fn typed(params: Vec<Shape>) -> Self {
        Self { params: Some(params) }
    }
}

/// An object whose selectors can be invoked locally or by a remote peer.
#[async_trait::async_trait]
pub trait Invocable: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    /// Returns `None` for selectors the object does not respond to.
    fn capability(&self, selector: &str) -> Option<Capability>;

    async fn invoke(&self, selector: &str, args: Args) -> std::result::Result<Value, Failure>;

    /// A copy of the object's state for pass-by-value; `None` if it has none.
    fn snapshot(&self) -> Option<Value> {
        None
    }
}

/// A handle to an invocable object, local or remote.
#[derive(Clone)]
pub enum Object {
    Local(Arc<dyn Invocable>),
    Remote(RemoteProxy),
}

impl Object {
    pub fn local(object: impl Invocable) -> Self {
        Object::Local(Arc::new(object))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Object::Local(o) => o.type_name(),
            Object::Remote(_) => "RemoteProxy",
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteProxy> {
        match self {
            Object::Remote(p) => Some(p),
            Object::Local(_) => None,
        }
    }

    /// The object as a registry entry; remote objects become forwarders.
    pub fn into_invocable(self) -> Arc<dyn Invocable> {
        match self {
            Object::Local(o) => o,
            Object::Remote(p) => Arc::new(p),
        }
    }

    /// Invokes `selector` with the same error surface as a remote call.
    pub async fn invoke(&self, selector: &str, args: Vec<Value>) -> Result<Value> {
        match self {
            Object::Remote(proxy) => proxy.invoke(selector, args).await,
            Object::Local(object) => {
                if object.capability(selector).is_none() {
                    return Err(Error::SelectorNotSupported {
                        selector: selector.to_string(),
                        type_name: object.type_name().to_string(),
                    });
                }
                object.invoke(selector, Args::new(args)).await.map_err(Error::from)
            }
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::Local(o) => write!(f, "Local({})", o.type_name()),
            Object::Remote(p) => write!(f, "Remote({}, {})", p.connection_id(), p.id()),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Local(a), Object::Local(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Object::Remote(a), Object::Remote(b)) => {
                a.connection_id() == b.connection_id() && a.id() == b.id()
            }
            _ => false,
        }
    }
}

type Handler = Arc<dyn Fn(Args) -> BoxFuture<'static, std::result::Result<Value, Failure>> + Send + Sync>;
type Snapshot = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

struct Method {
    params: Option<Vec<Shape>>,
    handler: Handler,
}

/// Builds an object from a table of selector closures.
///
/// ```ignore
/// let root = ObjectBuilder::new("Greeter")
///     .sync_method("returnString", |_| Ok("Swift String".into()))
///     .build();
/// ```
pub struct ObjectBuilder {
    type_name: String,
    methods: HashMap<String, Method>,
    snapshot: Option<Snapshot>,
}

impl ObjectBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            methods: HashMap::new(),
            snapshot: None,
        }
    }

    pub fn method<F, Fut>(self, selector: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        self.insert(selector.into(), None, boxed(f))
    }

    /// Like `method`, with arguments checked against `params` before the call.
    pub fn typed_method<F, Fut>(self, selector: impl Into<String>, params: Vec<Shape>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        self.insert(selector.into(), Some(params), boxed(f))
    }

    pub fn sync_method<F>(self, selector: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> std::result::Result<Value, Failure> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |args| futures::future::ready(f(args)).boxed());
        self.insert(selector.into(), None, handler)
    }

    /// Supplies the state copied when this object is passed by value.
    pub fn snapshot<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.snapshot = Some(Arc::new(move || Some(f())));
        self
    }

    pub fn build(self) -> Object {
        Object::local(BuiltObject {
            type_name: self.type_name,
            methods: self.methods,
            snapshot: self.snapshot,
        })
    }

    fn insert(mut self, selector: String, params: Option<Vec<Shape>>, handler: Handler) -> Self {
        self.methods.insert(selector, Method { params, handler });
        self
    }
}

fn boxed<F, Fut>(f: F) -> Handler
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

struct BuiltObject {
    type_name: String,
    methods: HashMap<String, Method>,
    snapshot: Option<Snapshot>,
}

#[async_trait::async_trait]
impl Invocable for BuiltObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn capability(&self, selector: &str) -> Option<Capability> {
        self.methods.get(selector).map(|m| Capability { params: m.params.clone() })
    }

    async fn invoke(&self, selector: &str, args: Args) -> std::result::Result<Value, Failure> {
        let Some(method) = self.methods.get(selector) else {
            return Err(Failure::new(&self.type_name, "SelectorNotSupported", selector));
        };
        (method.handler)(args).await
    }

    fn snapshot(&self) -> Option<Value> {
        self.snapshot.as_ref().and_then(|f| f())
    }
}

/// A closure exposed as an object with the single selector `call`.
pub struct Callback {
    handler: Handler,
}

impl Callback {
    pub const SELECTOR: &'static str = "call";

    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        Self { handler: boxed(f) }
    }
}

#[async_trait::async_trait]
impl Invocable for Callback {
    fn type_name(&self) -> &str {
        "Callback"
    }

    fn capability(&self, selector: &str) -> Option<Capability> {
        (selector == Self::SELECTOR).then(Capability::any)
    }

    async fn invoke(&self, _selector: &str, args: Args) -> std::result::Result<Value, Failure> {
        (self.handler)(args).await
    }
}

/// A mutable value shared by reference.
///
/// Passed normally, peers receive a proxy and observe later changes. Passed
/// through `Value::by_value`, peers receive an independent copy.
///
/// Selectors: `get`, `get(key)`, `set(value)`, `set(key, value)`, `len`,
/// `keys`, `remove(key)`.
#[derive(Clone)]
pub struct SharedValue {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    value: Mutex<Value>,
}

impl SharedValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self { inner: Arc::new(SharedInner { value: Mutex::new(value.into()) }) }
    }

    pub fn get(&self) -> Value {
        self.inner.lock().clone()
    }

    pub fn set(&self, value: impl Into<Value>) {
        *self.inner.lock() = value.into();
    }

    /// The object handle; every call returns the same identity.
    pub fn object(&self) -> Object {
        Object::Local(self.inner.clone())
    }
}

impl From<SharedValue> for Value {
    fn from(shared: SharedValue) -> Self {
        Value::Object(shared.object())
    }
}

impl SharedInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Value> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Invocable for SharedInner {
    fn type_name(&self) -> &str {
        "SharedValue"
    }

    fn capability(&self, selector: &str) -> Option<Capability> {
        match selector {
            "get" | "set" | "len" | "keys" | "remove" => Some(Capability::any()),
            _ => None,
        }
    }

    async fn invoke(&self, selector: &str, args: Args) -> std::result::Result<Value, Failure> {
        let mut value = self.lock();
        match (selector, args.len()) {
            ("get", 0) => Ok(value.clone()),
            ("get", 1) => {
                let key: String = args.arg(0)?;
                Ok(map_mut(&mut value)?.get(&key).cloned().unwrap_or(Value::Unit))
            }
            ("set", 1) => {
                *value = args.arg(0)?;
                Ok(Value::Unit)
            }
            ("set", 2) => {
                let key: String = args.arg(0)?;
                map_mut(&mut value)?.insert(key, args.arg(1)?);
                Ok(Value::Unit)
            }
            ("len", 0) => {
                let len = match &*value {
                    Value::Map(m) => m.len(),
                    Value::List(l) => l.len(),
                    Value::Str(s) => s.chars().count(),
                    Value::Bytes(b) => b.len(),
                    other => return Err(Failure::new("SharedValue", "NoLength", format!("{} has no length", other.kind()))),
                };
                Ok(Value::Int(len as i64))
            }
            ("keys", 0) => Ok(Value::List(map_mut(&mut value)?.keys().cloned().map(Value::Str).collect())),
            ("remove", 1) => {
                let key: String = args.arg(0)?;
                Ok(map_mut(&mut value)?.remove(&key).unwrap_or(Value::Unit))
            }
            (selector, n) => Err(Failure::bad_arguments(format!("{} takes a different number of arguments than {}", selector, n))),
        }
    }

    fn snapshot(&self) -> Option<Value> {
        Some(self.lock().clone())
    }
}

fn map_mut(value: &mut Value) -> std::result::Result<&mut BTreeMap<String, Value>, Failure> {
    match value {
        Value::Map(m) => Ok(m),
        other => Err(Failure::new("SharedValue", "NotAMap", format!("{} is not a map", other.kind()))),
    }
}
