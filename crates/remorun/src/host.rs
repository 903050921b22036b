//! # Host Service
//!
//! Listens on a host port and serves one root object to every peer that
//! connects. Each accepted stream runs the handshake and then becomes a
//! `Connection` sharing the service's registry and work context.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::HostConfig;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::context::WorkContext;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::handshake;
use crate::object::Object;
use crate::port::HostPort;
use crate::registry::Registry;
use crate::transport::TcpTransport;

/// A running host. Dropping it invalidates it.
pub struct HostService {
    inner: Arc<HostInner>,
}

struct HostInner {
    port: HostPort,
    config: HostConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    shutdown: watch::Sender<bool>,
    invalidated: AtomicBool,
}

impl HostService {
    /// Starts serving `root` at `port` on the given work context.
    pub async fn start(port: HostPort, root: Object, context: WorkContext) -> Result<Self> {
        Self::with_config(port, root, HostConfig::default().with_work_context(context)).await
    }

    pub async fn with_config(port: HostPort, root: Object, config: HostConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr, port.port))
            .await
            .map_err(|e| Error::Transport(e.into()))?;
        // port 0 asks the OS for a free port; report the one we got
        let bound = listener.local_addr().map_err(|e| Error::Transport(e.into()))?;
        let port = port.with_port(bound.port());

        let registry = Arc::new(Registry::new());
        registry.register_root(root.into_invocable())?;
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.work_context,
            config.reentry,
            config.marshal.clone(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(HostInner {
            port,
            config,
            registry,
            dispatcher,
            connections: DashMap::new(),
            shutdown,
            invalidated: AtomicBool::new(false),
        });

        info!(port = %inner.port, addr = %bound, registry = inner.registry.id(), "host listening");
        tokio::spawn(accept_loop(inner.clone(), listener, shutdown_rx));
        Ok(Self { inner })
    }

    /// The port being served, with the actual port number when 0 was requested.
    pub fn host_port(&self) -> &HostPort {
        &self.inner.port
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.invalidated.load(Ordering::SeqCst)
    }

    /// Stops accepting, closes every connection and releases the root.
    ///
    /// Remote callers waiting on this host fail with `ConnectionLost`.
    /// Calling it again has no effect.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }
}

impl Drop for HostService {
    fn drop(&mut self) {
        self.inner.invalidate();
    }
}

impl HostInner {
    fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(port = %self.port, connections = self.connections.len(), "host invalidated");
        self.shutdown.send_replace(true);

        let open: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        self.connections.clear();
        for conn in open {
            conn.close("host invalidated");
        }
        self.registry.close();
    }

    async fn admit(self: Arc<Self>, stream: TcpStream) {
        let transport = Arc::new(TcpTransport::new(stream, self.config.max_frame_size));
        let peer = transport.peer_addr();

        let hello = handshake::host_handshake(
            transport.as_ref(),
            &self.port,
            self.registry.id(),
            self.config.handshake_timeout,
        )
        .await;
        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                warn!(port = %self.port, ?peer, error = %e, "handshake failed");
                return;
            }
        };

        if self.invalidated.load(Ordering::SeqCst) {
            debug!(?peer, "host invalidated during handshake");
            return;
        }

        let conn = Connection::spawn(
            transport,
            self.dispatcher.clone(),
            hello.registry,
            self.config.call_timeout,
        );
        info!(port = %self.port, connection = %conn.id(), ?peer, "client connected");
        self.connections.insert(conn.id(), conn.clone());

        // lost the race with invalidate(): it may have drained the map already
        if self.invalidated.load(Ordering::SeqCst) {
            self.connections.remove(&conn.id());
            conn.close("host invalidated");
            return;
        }

        conn.closed().await;
        self.connections.remove(&conn.id());
    }
}

async fn accept_loop(host: Arc<HostInner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(port = %host.port, %addr, "accepted stream");
                    tokio::spawn(host.clone().admit(stream));
                }
                Err(e) => warn!(port = %host.port, error = %e, "accept failed"),
            },
        }
    }
    debug!(port = %host.port, "accept loop stopped");
}
