//! # Object Registry
//!
//! Maps object identities to live local objects for one service instance.
//!
//! Identities come from a per-registry counter and are never reassigned. An
//! entry is either *pinned* (registered explicitly, lives until released) or
//! *exported* (created on first exposure to a connection, lives while any
//! connection still holds references to it).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;

use crate::connection::ConnectionId;
use crate::error::Error;
use crate::error::Result;
use crate::object::Invocable;

/// Strong type for object identities.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The identity reserved for a host's root object.
    pub const ROOT: ObjectId = ObjectId(0);
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

struct Entry {
    object: Arc<dyn Invocable>,
    key: usize,
    /// Outstanding references held by each connection.
    exports: HashMap<ConnectionId, u64>,
    pinned: bool,
}

pub struct Registry {
    id: u64,
    next: AtomicU64,
    entries: DashMap<u64, Entry>,
    /// Allocation address to identity, so re-exposure keeps one identity.
    /// Lock order: `by_key` before `entries`.
    by_key: DashMap<usize, u64>,
    has_root: AtomicBool,
    closed: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            id: rand::random(),
            next: AtomicU64::new(ObjectId::ROOT.0 + 1),
            entries: DashMap::new(),
            by_key: DashMap::new(),
            has_root: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Random tag carried on the wire with every reference into this registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers `object` as the root, under `ObjectId::ROOT`.
    pub fn register_root(&self, object: Arc<dyn Invocable>) -> Result<ObjectId> {
        self.check_open()?;
        let key = key_of(&object);
        self.by_key.insert(key, ObjectId::ROOT.0);
        self.entries.insert(ObjectId::ROOT.0, Entry {
            object,
            key,
            exports: HashMap::new(),
            pinned: true,
        });
        self.has_root.store(true, Ordering::SeqCst);
        Ok(ObjectId::ROOT)
    }

    /// Registers `object` and pins it until `release`.
    ///
    /// Registering the same allocation twice returns the same identity.
    pub fn register(&self, object: Arc<dyn Invocable>) -> Result<ObjectId> {
        let key = key_of(&object);
        self.insert_keyed(key, None, || object, true)
    }

    /// Exposes `object` to `conn`, counting one more reference held there.
    pub fn export(&self, object: &Arc<dyn Invocable>, conn: ConnectionId) -> Result<ObjectId> {
        self.export_keyed(key_of(object), conn, || object.clone())
    }

    /// Like `export`, for objects whose identity is some other allocation.
    pub(crate) fn export_keyed(
        &self,
        key: usize,
        conn: ConnectionId,
        make: impl FnOnce() -> Arc<dyn Invocable>,
    ) -> Result<ObjectId> {
        self.insert_keyed(key, Some(conn), make, false)
    }

    fn insert_keyed(
        &self,
        key: usize,
        conn: Option<ConnectionId>,
        make: impl FnOnce() -> Arc<dyn Invocable>,
        pin: bool,
    ) -> Result<ObjectId> {
        self.check_open()?;
        match self.by_key.entry(key) {
            MapEntry::Occupied(mut slot) => {
                let id = *slot.get();
                if let Some(mut entry) = self.entries.get_mut(&id) {
                    if let Some(conn) = conn {
                        *entry.exports.entry(conn).or_insert(0) += 1;
                    }
                    entry.pinned |= pin;
                    return Ok(ObjectId(id));
                }
                // stale mapping left behind by a concurrent release
                let id = self.allocate(key, conn, make(), pin);
                slot.insert(id);
                Ok(ObjectId(id))
            }
            MapEntry::Vacant(slot) => {
                let id = self.allocate(key, conn, make(), pin);
                slot.insert(id);
                Ok(ObjectId(id))
            }
        }
    }

    fn allocate(&self, key: usize, conn: Option<ConnectionId>, object: Arc<dyn Invocable>, pinned: bool) -> u64 {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let mut exports = HashMap::new();
        if let Some(conn) = conn {
            exports.insert(conn, 1);
        }
        self.entries.insert(id, Entry { object, key, exports, pinned });
        id
    }

    /// Looks up a live object.
    ///
    /// Identities that were issued and later released fail with
    /// `ObjectReleased`; identities never issued fail with `NotFound`.
    pub fn resolve(&self, id: ObjectId) -> Result<Arc<dyn Invocable>> {
        if let Some(entry) = self.entries.get(&id.0) {
            return Ok(entry.object.clone());
        }
        let issued = if id == ObjectId::ROOT {
            self.has_root.load(Ordering::SeqCst)
        } else {
            id.0 < self.next.load(Ordering::SeqCst)
        };
        if self.is_closed() || issued {
            Err(Error::ObjectReleased(id))
        } else {
            Err(Error::NotFound(id))
        }
    }

    /// Removes an entry regardless of outstanding references.
    pub fn release(&self, id: ObjectId) -> bool {
        match self.entries.remove(&id.0) {
            Some((_, entry)) => {
                self.by_key.remove_if(&entry.key, |_, v| *v == id.0);
                true
            }
            None => false,
        }
    }

    /// Drops `count` references held by `conn`; exported entries with no
    /// remaining references are removed.
    pub fn release_remote(&self, id: ObjectId, conn: ConnectionId, count: u64) {
        let removed = self.entries.remove_if_mut(&id.0, |_, entry| {
            if let Some(held) = entry.exports.get_mut(&conn) {
                *held = held.saturating_sub(count);
                if *held == 0 {
                    entry.exports.remove(&conn);
                }
            }
            !entry.pinned && entry.exports.is_empty()
        });
        if let Some((_, entry)) = removed {
            self.by_key.remove_if(&entry.key, |_, v| *v == id.0);
        }
    }

    /// Forgets every reference held by `conn`.
    pub fn release_connection(&self, conn: ConnectionId) {
        let mut dropped = Vec::new();
        self.entries.retain(|id, entry| {
            entry.exports.remove(&conn);
            let keep = entry.pinned || !entry.exports.is_empty();
            if !keep {
                dropped.push((*id, entry.key));
            }
            keep
        });
        for (id, key) in dropped {
            self.by_key.remove_if(&key, |_, v| *v == id);
        }
    }

    /// Releases every entry, the root included. Later lookups fail with
    /// `ObjectReleased` and later registrations are refused.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.entries.clear();
        self.by_key.clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

fn key_of(object: &Arc<dyn Invocable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}
