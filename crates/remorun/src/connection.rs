//! # Connections
//!
//! A `Connection` owns one transport and multiplexes every invocation that
//! crosses it, in both directions.
//!
//! A background pump reads frames and routes them: replies complete the
//! pending caller registered under their sequence number, calls go to the
//! dispatcher on their own task, releases adjust the local registry. When the
//! transport fails or the connection is closed, every pending caller is
//! completed with `ConnectionLost` exactly once and later sends fail with
//! `ConnectionClosed`.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use remorpc::Call;
use remorpc::Fault;
use remorpc::Frame;
use remorpc::Position;
use remorpc::Reply;
use remorpc::WireValue;

use crate::config::MarshalPolicy;
use crate::context;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::proxy::ProxyInner;
use crate::proxy::RemoteProxy;
use crate::registry::ObjectId;
use crate::registry::Registry;
use crate::transport;
use crate::transport::Transport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Strong type for connection identifiers, unique within the process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type PendingReply = oneshot::Sender<Result<Reply>>;

pub(crate) struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    peer_registry: u64,
    pending: DashMap<u64, PendingReply>,
    seq_gen: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// One live proxy per remote identity.
    proxies: DashMap<u64, Weak<ProxyInner>>,
    runtime: Handle,
    call_timeout: Option<Duration>,
}

impl Connection {
    /// Wraps a transport that has completed its handshake and starts the pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        peer_registry: u64,
        call_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            transport,
            dispatcher,
            peer_registry,
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown,
            proxies: DashMap::new(),
            runtime: Handle::current(),
            call_timeout,
        });

        info!(connection = %conn.id, peer_registry, "connection established");
        tokio::spawn(conn.clone().pump(shutdown_rx));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_registry(&self) -> u64 {
        self.peer_registry
    }

    pub fn registry(&self) -> &Registry {
        self.dispatcher.registry()
    }

    pub fn policy(&self) -> &MarshalPolicy {
        self.dispatcher.policy()
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn pump(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let reason = loop {
            tokio::select! {
                _ = shutdown.changed() => break "closed locally".to_string(),
                msg = self.transport.recv() => match msg {
                    Ok(Some(bytes)) => self.handle_frame(&bytes),
                    Ok(None) => break "peer closed the connection".to_string(),
                    Err(e) => {
                        warn!(connection = %self.id, error = %e, "transport failed");
                        break e.to_string();
                    }
                },
            }
        };

        self.close(&reason);
        self.transport.close().await;
    }

    fn handle_frame(self: &Arc<Self>, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(Frame::Reply(reply)) => self.complete(reply.seq, Ok(reply)),
            Ok(Frame::Call(call)) => {
                let conn = self.clone();
                tokio::spawn(async move { conn.serve(call).await });
            }
            Ok(Frame::Release { id, count }) => {
                debug!(connection = %self.id, object = id, count, "peer released references");
                self.registry().release_remote(ObjectId(id), self.id, count);
            }
            Ok(other) => {
                warn!(connection = %self.id, kind = other.kind(), "unexpected frame after handshake");
            }
            Err(e) => self.handle_malformed(bytes, e),
        }
    }

    fn handle_malformed(self: &Arc<Self>, bytes: &[u8], error: remorpc::Error) {
        warn!(connection = %self.id, error = %error, "dropping malformed frame");
        let Ok(seq) = remorpc::decode_seq(bytes) else {
            return;
        };
        match remorpc::peek_kind(bytes) {
            Ok("Reply") => self.complete(seq, Err(Error::Protocol(error))),
            Ok("Call") => {
                let conn = self.clone();
                let fault = Fault::BadArguments(error.to_string());
                tokio::spawn(async move {
                    let _ = conn.send_frame(&Frame::Reply(Reply::fault(seq, fault))).await;
                });
            }
            _ => {}
        }
    }

    fn complete(&self, seq: u64, result: Result<Reply>) {
        // Find and remove the pending request; late or duplicate replies are dropped
        let Some((_, tx)) = self.pending.remove(&seq) else {
            debug!(connection = %self.id, seq, "reply for unknown sequence");
            return;
        };
        let _ = tx.send(result);
    }

    async fn serve(self: Arc<Self>, call: Call) {
        let seq = call.seq;
        debug!(connection = %self.id, seq, target = call.target, selector = %call.selector, "inbound call");
        let reply = self.dispatcher.dispatch(&self, call).await;
        let e = match self.send_frame(&Frame::Reply(reply)).await {
            Ok(()) => return,
            Err(e @ (Error::ConnectionClosed | Error::ConnectionLost(_))) => {
                debug!(connection = %self.id, seq, error = %e, "reply not delivered");
                return;
            }
            Err(e) => e,
        };

        // the reply could not be encoded or framed; the caller still gets an answer
        warn!(connection = %self.id, seq, error = %e, "reply does not fit on the wire");
        let fault = Fault::NotSerializable {
            position: Position::ReturnValue,
            reason: e.to_string(),
        };
        if let Err(e) = self.send_frame(&Frame::Reply(Reply::fault(seq, fault))).await {
            warn!(connection = %self.id, seq, error = %e, "fault reply not delivered");
            self.close("reply could not be delivered");
        }
    }

    /// Sends a call and waits for its reply.
    pub async fn call(&self, target: ObjectId, selector: &str, args: Vec<WireValue>) -> Result<Reply> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Call(Call::new(seq, target.0, selector, context::current_chain(), &args)?);
        let payload = frame.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        // close() flips the flag before draining, so either we see it here or
        // the drain sees our entry
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::ConnectionClosed);
        }

        debug!(connection = %self.id, seq, target = %target, selector, "outbound call");
        if let Err(e) = self.send_payload(&payload).await {
            self.pending.remove(&seq);
            return Err(e);
        }

        let outcome = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&seq);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost("reply channel dropped".into())),
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_payload(&frame.encode()?).await
    }

    async fn send_payload(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.transport.send(payload).await.map_err(|e| match e {
            transport::Error::ConnectionLost(msg) => Error::ConnectionLost(msg),
            other => Error::Transport(other),
        })
    }

    /// Returns the proxy for a remote identity, creating it on first sight.
    ///
    /// Each call accounts for one received reference.
    pub fn proxy_for(self: &Arc<Self>, id: ObjectId) -> RemoteProxy {
        let mut slot = self.proxies.entry(id.0).or_default();
        if let Some(inner) = slot.upgrade() {
            inner.received.fetch_add(1, Ordering::SeqCst);
            return RemoteProxy { inner };
        }
        let inner = Arc::new(ProxyInner {
            id,
            conn: self.clone(),
            received: AtomicU64::new(1),
        });
        *slot = Arc::downgrade(&inner);
        RemoteProxy { inner }
    }

    pub(crate) fn forget_proxy(&self, id: ObjectId) {
        self.proxies.remove_if(&id.0, |_, weak| weak.strong_count() == 0);
    }

    /// Tells the peer that `count` references to `id` were dropped.
    pub(crate) fn release_later(self: &Arc<Self>, id: ObjectId, count: u64) {
        let conn = self.clone();
        self.runtime.spawn(async move {
            let frame = Frame::Release { id: id.0, count };
            if let Err(e) = conn.send_frame(&frame).await {
                debug!(connection = %conn.id, object = %id, error = %e, "release not delivered");
            }
        });
    }

    /// Closes the connection. Pending callers get `ConnectionLost`; references
    /// the peer held into the local registry are dropped. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(connection = %self.id, reason, "connection closed");
        self.shutdown.send_replace(true);
        self.notify_all_pending(Error::ConnectionLost(reason.to_string()));
        self.registry().release_connection(self.id);
    }

    /// Notify all pending requests with the given error.
    fn notify_all_pending(&self, error: Error) {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
