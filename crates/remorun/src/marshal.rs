//! # Marshalling
//!
//! Converts between `Value` and `WireValue` for one connection.
//!
//! Outbound, local objects are exported into the local registry and become
//! references; proxies bound to the same connection become references into
//! the peer's registry; proxies bound elsewhere are re-exported as
//! forwarders. Inbound, references into the local registry resolve to the
//! live object and references into the peer's registry become proxies.

use std::sync::Arc;

use remorpc::MAX_RECURSION_DEPTH;
use remorpc::ObjectRef;
use remorpc::Position;
use remorpc::WireValue;

use crate::connection::Connection;
use crate::error::Error;
use crate::error::Result;
use crate::object::Invocable;
use crate::object::Object;
use crate::registry::ObjectId;
use crate::value::Coded;
use crate::value::Value;

pub(crate) fn to_wire(conn: &Arc<Connection>, value: &Value, position: Position) -> Result<WireValue> {
    to_wire_impl(conn, value, position, 0)
}

fn to_wire_impl(conn: &Arc<Connection>, value: &Value, position: Position, depth: usize) -> Result<WireValue> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::NotSerializable { position, reason: "value nesting exceeds recursion limit".into() });
    }

    let wire = match value {
        Value::Unit => WireValue::Unit,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(v) => WireValue::Int(*v),
        Value::UInt(v) => WireValue::UInt(*v),
        Value::Float(v) => WireValue::Float(*v),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|item| to_wire_impl(conn, item, position, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Value::Map(entries) => WireValue::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_wire_impl(conn, v, position, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Coded(c) => WireValue::Coded { type_name: c.type_name.clone(), data: c.data.clone() },
        Value::Object(object) => object_to_wire(conn, object, position, depth)?,
        Value::ByValue(inner) => match inner.as_ref() {
            Value::Object(Object::Local(object)) => {
                let snapshot = snapshot_of(object.as_ref(), position)?;
                to_wire_impl(conn, &snapshot, position, depth + 1)?
            }
            Value::Object(Object::Remote(_)) => {
                return Err(Error::NotSerializable {
                    position,
                    reason: "a remote object cannot be copied by value".into(),
                });
            }
            plain => to_wire_impl(conn, plain, position, depth + 1)?,
        },
    };
    Ok(wire)
}

fn object_to_wire(conn: &Arc<Connection>, object: &Object, position: Position, depth: usize) -> Result<WireValue> {
    let registry = conn.registry();
    match object {
        Object::Local(local) => {
            if conn.policy().copies(local.type_name()) {
                let snapshot = snapshot_of(local.as_ref(), position)?;
                return to_wire_impl(conn, &snapshot, position, depth + 1);
            }
            let id = registry.export(local, conn.id()).map_err(|e| Error::NotSerializable {
                position,
                reason: e.to_string(),
            })?;
            Ok(WireValue::Ref(ObjectRef { registry: registry.id(), id: id.0 }))
        }
        Object::Remote(proxy) if Arc::ptr_eq(proxy.connection(), conn) => {
            Ok(WireValue::Ref(ObjectRef { registry: conn.peer_registry(), id: proxy.id().0 }))
        }
        Object::Remote(proxy) => {
            if !proxy.is_valid() {
                return Err(Error::NotSerializable {
                    position,
                    reason: format!("proxy for {} belongs to a closed connection", proxy.id()),
                });
            }
            let key = Arc::as_ptr(&proxy.inner) as usize;
            let forwarder = proxy.clone();
            let id = registry
                .export_keyed(key, conn.id(), move || Arc::new(forwarder) as Arc<dyn Invocable>)
                .map_err(|e| Error::NotSerializable { position, reason: e.to_string() })?;
            Ok(WireValue::Ref(ObjectRef { registry: registry.id(), id: id.0 }))
        }
    }
}

fn snapshot_of(object: &dyn Invocable, position: Position) -> Result<Value> {
    object.snapshot().ok_or_else(|| Error::NotSerializable {
        position,
        reason: format!("{} has no value snapshot", object.type_name()),
    })
}

pub(crate) fn from_wire(conn: &Arc<Connection>, wire: WireValue) -> Result<Value> {
    let value = match wire {
        WireValue::Unit => Value::Unit,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(v) => Value::Int(v),
        WireValue::UInt(v) => Value::UInt(v),
        WireValue::Float(v) => Value::Float(v),
        WireValue::Str(s) => Value::Str(s),
        WireValue::Bytes(b) => Value::Bytes(b),
        WireValue::List(items) => Value::List(
            items.into_iter().map(|w| from_wire(conn, w)).collect::<Result<_>>()?,
        ),
        WireValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, w)| Ok((k, from_wire(conn, w)?)))
                .collect::<Result<_>>()?,
        ),
        WireValue::Coded { type_name, data } => Value::Coded(Coded { type_name, data }),
        WireValue::Ref(r) if r.registry == conn.registry().id() => {
            Value::Object(Object::Local(conn.registry().resolve(ObjectId(r.id))?))
        }
        WireValue::Ref(r) if r.registry == conn.peer_registry() => {
            Value::Object(Object::Remote(conn.proxy_for(ObjectId(r.id))))
        }
        WireValue::Ref(r) => {
            return Err(Error::Protocol(remorpc::Error::ProtocolViolation(format!(
                "reference {} names neither endpoint's registry",
                r
            ))));
        }
    };
    Ok(value)
}
