//! # Client Service
//!
//! Connects to host ports and hands out proxies for their root objects.
//!
//! A client keeps at most one open connection per `HostPort`; later lookups
//! of the same port reuse it. The client also owns a registry of its own, so
//! callbacks and objects it passes to hosts can be invoked back.

use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::handshake;
use crate::port::HostPort;
use crate::proxy::RemoteProxy;
use crate::registry::ObjectId;
use crate::registry::Registry;
use crate::transport::TcpTransport;

#[derive(Clone)]
pub struct ClientService {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    connections: DashMap<HostPort, Arc<Connection>>,
}

impl Default for ClientService {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientService {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.work_context,
            config.reentry,
            config.marshal.clone(),
        ));
        Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                dispatcher,
                connections: DashMap::new(),
            }),
        }
    }

    /// The registry holding objects this client has exposed to hosts.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Returns a proxy for the root object served at `port`.
    ///
    /// Fails with `HostUnreachable` if nothing listens there or the host
    /// refuses the port's name or device qualifiers.
    pub async fn root_object(&self, port: &HostPort) -> Result<RemoteProxy> {
        let conn = self.connect(port).await?;
        Ok(conn.proxy_for(ObjectId::ROOT))
    }

    /// Blocking form of `root_object`, for threads outside any runtime.
    ///
    /// Connections opened this way are driven by a shared background runtime.
    pub fn root_object_blocking(&self, port: &HostPort) -> Result<RemoteProxy> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::ReentrantDeadlock);
        }
        background()?.block_on(self.root_object(port))
    }

    /// Closes the connection to `port`, invalidating its proxies.
    pub fn disconnect(&self, port: &HostPort) {
        if let Some((_, conn)) = self.inner.connections.remove(port) {
            conn.close("client disconnected");
        }
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.iter().filter(|c| !c.value().is_closed()).count()
    }

    async fn connect(&self, port: &HostPort) -> Result<Arc<Connection>> {
        if let Some(conn) = self.inner.connections.get(port) {
            if !conn.is_closed() {
                return Ok(conn.value().clone());
            }
        }

        let config = &self.inner.config;
        let addr = (config.host, port.port);
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::HostUnreachable(format!("{}: {}", port, e))),
            Err(_) => return Err(Error::HostUnreachable(format!("{}: connect timed out", port))),
        };

        let transport = Arc::new(TcpTransport::new(stream, config.max_frame_size));
        let peer_registry = handshake::client_handshake(
            transport.as_ref(),
            port,
            self.inner.registry.id(),
            config.handshake_timeout,
        )
        .await
        .map_err(|e| match e {
            Error::HostUnreachable(_) => e,
            other => Error::HostUnreachable(format!("{}: handshake failed: {}", port, other)),
        })?;

        let conn = Connection::spawn(transport, self.inner.dispatcher.clone(), peer_registry, config.call_timeout);
        info!(%port, connection = %conn.id(), "connected to host");

        // another task may have connected concurrently; keep whichever landed first
        let mut slot = self.inner.connections.entry(port.clone()).or_insert_with(|| conn.clone());
        if slot.is_closed() {
            *slot = conn.clone();
        }
        let chosen = slot.value().clone();
        drop(slot);

        if !Arc::ptr_eq(&chosen, &conn) {
            debug!(%port, connection = %conn.id(), "dropping duplicate connection");
            conn.close("duplicate connection");
        }
        Ok(chosen)
    }
}

fn background() -> Result<&'static tokio::runtime::Runtime> {
    static RUNTIME: OnceLock<std::result::Result<tokio::runtime::Runtime, String>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("remorun-client")
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| Error::Transport(crate::transport::Error::Io(e.clone())))
}

/// The client used by the free function `root_object`.
pub fn default_client() -> &'static ClientService {
    static CLIENT: OnceLock<ClientService> = OnceLock::new();
    CLIENT.get_or_init(ClientService::new)
}

/// Returns a proxy for the root object at `port` using the default client.
pub async fn root_object(port: &HostPort) -> Result<RemoteProxy> {
    default_client().root_object(port).await
}
