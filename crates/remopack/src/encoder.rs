//! Scope-checked encoder with length back-patching.

use crate::Decoder;
use crate::Error;
use crate::Result;
use crate::Scope;
use crate::Tag;

/// An open container on the encoder stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A bounded, state-machine driven encoder.
///
/// The encoder keeps a stack of open scopes and rejects writes that would
/// produce a structurally invalid buffer:
///
/// 1. **Map scopes** only accept `Tag::Variant` items (key/value pairs).
/// 2. **Option, Result and Variant scopes** accept exactly one item.
/// 3. The buffer can only be finalized once every scope is closed.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Creates an encoder whose buffer starts with `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut stack = Vec::with_capacity(8);
        stack.push(Frame { start: 0, scope: Scope::Root, count: 0 });
        Self { buf: Vec::with_capacity(capacity), stack }
    }

    /// Consumes the encoder and returns the final byte vector.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    /// Current nesting depth; zero when only the root is open.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    fn check_write(&self, tag: Tag) -> Result<()> {
        let Some(frame) = self.stack.last() else {
            return Err(Error::ScopeUnderflow);
        };
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Option | Scope::Result | Scope::Variant if frame.count >= 1 => {
                Err(Error::TooManyItems(frame.scope))
            }
            Scope::Option | Scope::Result | Scope::Variant => Ok(()),
        }
    }

    fn item_written(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.count += 1;
        }
    }

    fn scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.item_written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        if frame.scope != expected {
            let actual = frame.scope;
            self.stack.push(frame);
            return Err(Error::ScopeMismatch { expected, actual });
        }
        if matches!(frame.scope, Scope::Option | Scope::Result | Scope::Variant) && frame.count == 0 {
            let scope = frame.scope;
            self.stack.push(frame);
            return Err(Error::EmptyAdt(scope));
        }

        let body_len = self.buf.len() - frame.start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[frame.start - 4..frame.start].copy_from_slice(&len.to_le_bytes());
        self.item_written();
        Ok(())
    }

    pub fn unit(&mut self) -> Result<()> { self.scalar(Tag::Unit, &[]) }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Tag::U64, &v.to_le_bytes()) }
    pub fn s64(&mut self, v: i64) -> Result<()> { self.scalar(Tag::S64, &v.to_le_bytes()) }
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Tag::F64, &v.to_le_bytes()) }

    pub fn option_none(&mut self) -> Result<()> { self.scalar(Tag::OptionNone, &[]) }

    /// Encodes an object reference as `(registry, id)`.
    pub fn object_ref(&mut self, registry: u64, id: u64) -> Result<()> {
        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&registry.to_le_bytes());
        data[8..].copy_from_slice(&id.to_le_bytes());
        self.scalar(Tag::Ref, &data)
    }

    /// Writes exactly one item that was encoded elsewhere.
    ///
    /// The bytes are validated as a single well-formed item before they are
    /// spliced in, so scope rules still apply to the item's tag.
    pub fn item(&mut self, raw: &[u8]) -> Result<()> {
        let mut dec = Decoder::new(raw);
        let tag = dec.peek_tag()?;
        dec.skip()?;
        dec.finish()?;
        self.check_write(tag)?;
        self.buf.extend_from_slice(raw);
        self.item_written();
        Ok(())
    }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    /// Begins a List container. Allows any number of items.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map container. Only `variant_begin()` entries are allowed inside.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    pub fn option_some_begin(&mut self) -> Result<()> { self.begin_scope(Tag::OptionSome, Scope::Option) }
    pub fn option_some_end(&mut self) -> Result<()> { self.end_scope(Scope::Option) }

    pub fn result_ok_begin(&mut self) -> Result<()> { self.begin_scope(Tag::ResultOk, Scope::Result) }
    pub fn result_ok_end(&mut self) -> Result<()> { self.end_scope(Scope::Result) }

    pub fn result_err_begin(&mut self) -> Result<()> { self.begin_scope(Tag::ResultErr, Scope::Result) }
    pub fn result_err_end(&mut self) -> Result<()> { self.end_scope(Scope::Result) }

    /// Begins a named payload. Exactly one item must follow before `variant_end()`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // the name is metadata; the payload count starts after it
        if let Some(frame) = self.stack.last_mut() {
            frame.count = 0;
        }
        Ok(())
    }
    pub fn variant_end(&mut self) -> Result<()> { self.end_scope(Scope::Variant) }

    /// Writes a map entry whose payload is produced by `f`.
    pub fn entry(&mut self, key: &str, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.variant_begin(key)?;
        f(self)?;
        self.variant_end()
    }
}
