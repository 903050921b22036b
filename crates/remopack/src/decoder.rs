//! Zero-copy, bounds-checked decoding views.

use crate::Error;
use crate::Result;
use crate::Tag;

/// A zero-copy cursor over a byte slice.
///
/// Reading advances the cursor. Container reads return new `Decoder`s
/// restricted to the container body, so a malformed child can never read
/// past its parent.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the unread bytes without advancing.
    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }

    /// Fails with `TrailingBytes` unless the view has been fully consumed.
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::TrailingBytes(self.buf.len()))
        }
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_bytes(N)?.try_into().map_err(|_| Error::UnexpectedEnd)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.consume(1)
    }

    fn enter(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.expect_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Skips the next item and all of its children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;
        match tag.fixed_width() {
            Some(width) => self.consume(width),
            None => {
                let len = self.read_len()?;
                self.consume(len)
            }
        }
    }

    pub fn unit(&mut self) -> Result<()> { self.expect_tag(Tag::Unit) }

    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.consume(1)?; Ok(true) }
            Tag::BoolFalse => { self.consume(1)?; Ok(false) }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    pub fn u64(&mut self) -> Result<u64> { self.expect_tag(Tag::U64)?; Ok(u64::from_le_bytes(self.read_array()?)) }
    pub fn s64(&mut self) -> Result<i64> { self.expect_tag(Tag::S64)?; Ok(i64::from_le_bytes(self.read_array()?)) }
    pub fn f64(&mut self) -> Result<f64> { self.expect_tag(Tag::F64)?; Ok(f64::from_le_bytes(self.read_array()?)) }

    /// Decodes an object reference as `(registry, id)`.
    pub fn object_ref(&mut self) -> Result<(u64, u64)> {
        self.expect_tag(Tag::Ref)?;
        let registry = u64::from_le_bytes(self.read_array()?);
        let id = u64::from_le_bytes(self.read_array()?);
        Ok((registry, id))
    }

    pub fn str(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        let len = self.read_len()?;
        std::str::from_utf8(self.read_bytes(len)?).map_err(|_| Error::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter(Tag::Map)? })
    }

    /// Returns `Some(payload)` for a present option, `None` otherwise.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => { self.consume(1)?; Ok(None) }
            Tag::OptionSome => Ok(Some(self.enter(Tag::OptionSome)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::OptionSome, found }),
        }
    }

    /// Returns the payload of a result, split by side.
    pub fn result(&mut self) -> Result<std::result::Result<Decoder<'a>, Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::ResultOk => Ok(Ok(self.enter(Tag::ResultOk)?)),
            Tag::ResultErr => Ok(Err(self.enter(Tag::ResultErr)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::ResultOk, found }),
        }
    }

    /// Returns `(name, payload)` of a variant.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Iterator over the items of a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a decoder scoped to the next item, `Ok(None)` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator over the key/value entries of a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(key, value)` for the next entry, `Ok(None)` at the end.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        self.dec.variant().map(Some)
    }
}
