//! # RemoRun
//!
//! Cross-process object invocation over TCP.
//!
//! A `HostService` exposes one root object at a `HostPort`. A `ClientService`
//! connects to it and hands back a `RemoteProxy`; invoking a selector on the
//! proxy runs the method in the host process and returns its value or error.
//! Objects and closures passed along the way travel as references and may be
//! invoked back across the same connection.

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod host;
pub mod object;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod transport;
pub mod value;

mod dispatch;
mod handshake;
mod marshal;

pub use client::ClientService;
pub use client::default_client;
pub use client::root_object;
pub use config::ClientConfig;
pub use config::HostConfig;
pub use config::MarshalPolicy;
pub use connection::ConnectionId;
pub use context::ReentryPolicy;
pub use context::WorkContext;
pub use error::Error;
pub use error::Failure;
pub use error::Result;
pub use host::HostService;
pub use object::Callback;
pub use object::Capability;
pub use object::Invocable;
pub use object::Object;
pub use object::ObjectBuilder;
pub use object::SharedValue;
pub use port::HostPort;
pub use proxy::RemoteProxy;
pub use registry::ObjectId;
pub use registry::Registry;
pub use transport::MemoryTransport;
pub use transport::TcpTransport;
pub use transport::Transport;
pub use value::Args;
pub use value::Coded;
pub use value::FromValue;
pub use value::Value;
pub use value::contract_name;

pub use remorpc::ErrorEnvelope;
pub use remorpc::Position;
pub use remorpc::Shape;

#[cfg(test)]
mod tests;
