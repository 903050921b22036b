//! # Handshake
//!
//! The first exchange on every transport: the client introduces its registry
//! and the port qualifiers it expects; the host answers with its own
//! registry or refuses the connection.

use std::time::Duration;

use tracing::debug;
use tracing::warn;

use remorpc::Frame;
use remorpc::Hello;
use remorpc::PROTOCOL_VERSION;

use crate::error::Error;
use crate::error::Result;
use crate::port::HostPort;
use crate::transport::Transport;

/// Runs the connecting side. Returns the host's registry id.
pub(crate) async fn client_handshake(
    transport: &dyn Transport,
    port: &HostPort,
    registry: u64,
    timeout: Duration,
) -> Result<u64> {
    let hello = Frame::Hello(Hello {
        version: PROTOCOL_VERSION,
        registry,
        name: port.name.clone(),
        device: port.device_serial.clone(),
    });
    transport.send(&hello.encode()?).await?;

    let reply = match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(reply) => reply?,
        Err(_) => return Err(Error::HostUnreachable(format!("{}: handshake timed out", port))),
    };
    let Some(bytes) = reply else {
        return Err(Error::HostUnreachable(format!("{}: closed during handshake", port)));
    };

    match Frame::decode(&bytes)? {
        Frame::Welcome { version, registry } if version == PROTOCOL_VERSION => {
            debug!(%port, peer_registry = registry, "handshake accepted");
            Ok(registry)
        }
        Frame::Welcome { version, .. } => Err(Error::HostUnreachable(format!(
            "{}: host speaks protocol {}, expected {}",
            port, version, PROTOCOL_VERSION
        ))),
        Frame::Reject { reason } => Err(Error::HostUnreachable(format!("{}: {}", port, reason))),
        other => Err(Error::Protocol(remorpc::Error::ProtocolViolation(format!(
            "expected Welcome, got {}",
            other.kind()
        )))),
    }
}

/// Runs the accepting side. Returns the client's greeting.
pub(crate) async fn host_handshake(
    transport: &dyn Transport,
    port: &HostPort,
    registry: u64,
    timeout: Duration,
) -> Result<Hello> {
    let first = match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(first) => first?,
        Err(_) => return Err(Error::Timeout),
    };
    let Some(bytes) = first else {
        return Err(Error::ConnectionLost("closed during handshake".into()));
    };

    let Frame::Hello(hello) = Frame::decode(&bytes)? else {
        return Err(Error::Protocol(remorpc::Error::ProtocolViolation("expected Hello".into())));
    };

    let refusal = if hello.version != PROTOCOL_VERSION {
        Some(format!("protocol {} is not supported, expected {}", hello.version, PROTOCOL_VERSION))
    } else if !port.qualifiers_match(hello.name.as_deref(), hello.device.as_deref()) {
        Some(format!(
            "{} does not serve name {:?} on device {:?}",
            port, hello.name, hello.device
        ))
    } else {
        None
    };

    if let Some(reason) = refusal {
        warn!(%port, %reason, "rejecting connection");
        let reject = Frame::Reject { reason: reason.clone() };
        transport.send(&reject.encode()?).await?;
        transport.close().await;
        return Err(Error::HostUnreachable(reason));
    }

    let welcome = Frame::Welcome { version: PROTOCOL_VERSION, registry };
    transport.send(&welcome.encode()?).await?;
    Ok(hello)
}
