//! # Remopack
//!
//! A small, bounded TLV byte format for the remote-object wire.
//!
//! Every item is `[tag][length?][payload]`, so a reader can step over items it
//! does not recognise and frames stay readable as fields are added. The
//! encoder keeps a stack of open scopes and fills in container lengths when a
//! scope closes; decoders borrow the input and check every bound.
//!
//! Object references are two opaque integers (registry tag, object id). The
//! format has no way to carry a memory address.
//!
//! ## Layout
//!
//! | item       | bytes                                      |
//! |------------|--------------------------------------------|
//! | scalar     | tag, then 0 or 8 payload bytes             |
//! | string/blob| tag, u32 length, raw bytes                 |
//! | container  | tag, u32 length, nested items              |
//! | reference  | tag, u64 registry, u64 object              |
//!
//! Multi-byte integers are little-endian.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use decoder::ListIter;
pub use decoder::MapIter;
pub use encoder::Encoder;


/// Remopack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// A valid tag was found where a different one was required.
    UnexpectedTag { expected: Tag, found: Tag },
    InvalidUtf8,
    /// The scope being closed is not the innermost open one.
    ScopeMismatch { expected: Scope, actual: Scope },
    ScopeUnderflow,
    /// `into_bytes` was called while a container was still open.
    ScopeStillOpen,
    /// The input ended in the middle of an item.
    UnexpectedEnd,
    /// Bytes were left over after the last expected item.
    TrailingBytes(usize),
    /// A length that does not fit the u32 header.
    BlobTooLarge(usize),
    /// A second item written into a single-item scope.
    TooManyItems(Scope),
    /// A single-item scope closed while empty.
    EmptyAdt(Scope),
    /// Map bodies hold keyed entries only.
    InvalidMapEntry,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, found } => {
                write!(f, "unexpected tag: expected {:?}, found {:?}", expected, found)
            }
            Error::InvalidUtf8 => write!(f, "string data is not valid utf-8"),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::ScopeUnderflow => write!(f, "no open scope to close"),
            Error::ScopeStillOpen => write!(f, "encoder finalized with open scopes"),
            Error::UnexpectedEnd => write!(f, "unexpected end of buffer"),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after last item", n),
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds u32 length", n),
            Error::TooManyItems(s) => write!(f, "too many items in scope {:?}; expected exactly 1", s),
            Error::EmptyAdt(s) => write!(f, "empty scope {:?}; expected exactly 1 item", s),
            Error::InvalidMapEntry => write!(f, "map entries must be variants"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// First byte of every item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Unit = 0x01,
    BoolTrue = 0x02,
    BoolFalse = 0x03,
    OptionNone = 0x04,
    U64 = 0x05,
    S64 = 0x06,
    F64 = 0x07,

    // length-prefixed
    String = 0x10,
    Bytes = 0x11,
    List = 0x20,
    Map = 0x21,
    OptionSome = 0x30,
    ResultOk = 0x31,
    ResultErr = 0x32,
    Variant = 0x33,

    Ref = 0x40,
}

impl Tag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Tag::Unit),
            0x02 => Some(Tag::BoolTrue),
            0x03 => Some(Tag::BoolFalse),
            0x04 => Some(Tag::OptionNone),
            0x05 => Some(Tag::U64),
            0x06 => Some(Tag::S64),
            0x07 => Some(Tag::F64),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x30 => Some(Tag::OptionSome),
            0x31 => Some(Tag::ResultOk),
            0x32 => Some(Tag::ResultErr),
            0x33 => Some(Tag::Variant),
            0x40 => Some(Tag::Ref),
            _ => None,
        }
    }

    /// Number of bytes that follow the tag byte, or `None` when the item
    /// carries its own u32 length header.
    pub(crate) fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::Unit | Tag::BoolTrue | Tag::BoolFalse | Tag::OptionNone => Some(0),
            Tag::U64 | Tag::S64 | Tag::F64 => Some(8),
            Tag::Ref => Some(16),
            _ => None,
        }
    }
}

/// Containers the `Encoder` can have open.
///
/// `Option`, `Result` and `Variant` hold exactly one item; a `Variant` is a
/// name followed by its payload. `Map` holds only keyed entries, which are
/// variants. `Root` and `List` hold any number of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    List,
    Map,
    Option,
    Result,
    Variant,
}
