//! # Remote Proxies
//!
//! A `RemoteProxy` stands in for an object that lives in a peer's registry.
//! It does not own the remote object's lifetime; dropping the last proxy for
//! an identity tells the peer how many references were released.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;

use remorpc::Position;

use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::marshal;
use crate::object::Capability;
use crate::object::Invocable;
use crate::registry::ObjectId;
use crate::value::Args;
use crate::value::FromValue;
use crate::value::Value;

pub(crate) struct ProxyInner {
    pub(crate) id: ObjectId,
    pub(crate) conn: Arc<Connection>,
    /// References to `id` received over `conn` and folded into this proxy.
    pub(crate) received: AtomicU64,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        self.conn.forget_proxy(self.id);
        if self.id == ObjectId::ROOT || self.conn.is_closed() {
            return;
        }
        let count = self.received.load(Ordering::SeqCst);
        if count > 0 {
            debug!(connection = %self.conn.id(), object = %self.id, count, "releasing remote references");
            self.conn.release_later(self.id, count);
        }
    }
}

/// A local handle on an object in a peer process.
///
/// Clones share one underlying proxy.
#[derive(Clone)]
pub struct RemoteProxy {
    pub(crate) inner: Arc<ProxyInner>,
}

impl RemoteProxy {
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.conn.id()
    }

    /// False once the owning connection has closed; it never becomes true again.
    pub fn is_valid(&self) -> bool {
        !self.inner.conn.is_closed()
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.inner.conn
    }

    /// Invokes `selector` on the remote object and waits for its outcome.
    pub async fn invoke(&self, selector: &str, args: Vec<Value>) -> Result<Value> {
        let conn = &self.inner.conn;
        if conn.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let wire_args = args
            .iter()
            .enumerate()
            .map(|(i, arg)| marshal::to_wire(conn, arg, Position::Argument(i)))
            .collect::<Result<Vec<_>>>()?;

        let reply = conn.call(self.inner.id, selector, wire_args).await?;
        match reply.value(&remorpc::Shape::Any)? {
            Ok(wire) => marshal::from_wire(conn, wire),
            Err(fault) => Err(fault.into()),
        }
    }

    /// Invokes `selector` and converts the result.
    pub async fn invoke_as<T: FromValue>(&self, selector: &str, args: Vec<Value>) -> Result<T> {
        let value = self.invoke(selector, args).await?;
        let kind = value.kind();
        T::from_value(value).ok_or_else(|| {
            Error::Protocol(remorpc::Error::TypeMismatch {
                expected: T::shape().to_string(),
                found: kind.to_string(),
            })
        })
    }

    /// Blocks the calling thread until the invocation completes.
    ///
    /// Must not be called from inside a tokio runtime; doing so returns
    /// `ReentrantDeadlock` instead of stalling the runtime. Use `invoke` there.
    pub fn invoke_blocking(&self, selector: &str, args: Vec<Value>) -> Result<Value> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::ReentrantDeadlock);
        }
        self.inner.conn.runtime().block_on(self.invoke(selector, args))
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("connection", &self.connection_id())
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Forwarding: a proxy re-exposed to a third party relays every call.
#[async_trait::async_trait]
impl Invocable for RemoteProxy {
    fn type_name(&self) -> &str {
        "RemoteProxy"
    }

    fn capability(&self, _selector: &str) -> Option<Capability> {
        Some(Capability::any())
    }

    async fn invoke(&self, selector: &str, args: Args) -> std::result::Result<Value, Failure> {
        RemoteProxy::invoke(self, selector, args.into_vec()).await.map_err(Failure::from)
    }
}
