//! # RemoRPC
//!
//! The wire protocol for remote-object invocation, layered over remopack.
//!
//! ## Architecture
//!
//! - `value`: `WireValue` and `Shape`, the address-free value model and its codec.
//! - `frame`: the handshake, call, reply and release frames.
//! - `fault`: remote failure reasons and the transportable `ErrorEnvelope`.
//!
//! Every frame is a top-level variant whose body is a keyed map, so fields may
//! be added without breaking older readers.

pub mod error;
pub mod fault;
pub mod frame;
pub mod value;

pub use error::Error;
pub use error::Result;
pub use fault::ErrorEnvelope;
pub use fault::Fault;
pub use fault::Position;
pub use frame::Call;
pub use frame::Frame;
pub use frame::Hello;
pub use frame::PROTOCOL_VERSION;
pub use frame::Reply;
pub use frame::decode_seq;
pub use frame::peek_kind;
pub use value::MAX_RECURSION_DEPTH;
pub use value::ObjectRef;
pub use value::Shape;
pub use value::WireValue;
pub use value::decode_args;
pub use value::encode_args;
pub use value::from_bytes;
pub use value::to_bytes;
