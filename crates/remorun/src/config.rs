//! # Service Configuration
//!
//! Plain structs with defaults and chainable `with_*` setters.

use std::collections::HashSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::context::ReentryPolicy;
use crate::context::WorkContext;
use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Decides which objects travel as copies instead of references.
///
/// Plain values always copy and objects travel by reference unless wrapped
/// with `Value::by_value`. Type names listed here are snapshotted by default.
#[derive(Clone, Debug, Default)]
pub struct MarshalPolicy {
    by_value_types: HashSet<String>,
}

impl MarshalPolicy {
    /// Copies objects whose `type_name()` equals `type_name`.
    pub fn by_value(mut self, type_name: impl Into<String>) -> Self {
        self.by_value_types.insert(type_name.into());
        self
    }

    pub fn copies(&self, type_name: &str) -> bool {
        self.by_value_types.contains(type_name)
    }
}

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub bind_addr: IpAddr,
    pub work_context: WorkContext,
    pub reentry: ReentryPolicy,
    pub handshake_timeout: Duration,
    /// Applies to callbacks the host issues back to its clients.
    pub call_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub marshal: MarshalPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            work_context: WorkContext::Serial,
            reentry: ReentryPolicy::Inline,
            handshake_timeout: Duration::from_secs(5),
            call_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            marshal: MarshalPolicy::default(),
        }
    }
}

impl HostConfig {
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_work_context(mut self, context: WorkContext) -> Self {
        self.work_context = context;
        self
    }

    pub fn with_reentry(mut self, policy: ReentryPolicy) -> Self {
        self.reentry = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_marshal_policy(mut self, policy: MarshalPolicy) -> Self {
        self.marshal = policy;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Address the host ports are resolved against.
    pub host: IpAddr,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub call_timeout: Option<Duration>,
    /// Context that runs callbacks invoked by hosts.
    pub work_context: WorkContext,
    pub reentry: ReentryPolicy,
    pub max_frame_size: usize,
    pub marshal: MarshalPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: None,
            work_context: WorkContext::Concurrent,
            reentry: ReentryPolicy::Inline,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            marshal: MarshalPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_work_context(mut self, context: WorkContext) -> Self {
        self.work_context = context;
        self
    }

    pub fn with_reentry(mut self, policy: ReentryPolicy) -> Self {
        self.reentry = policy;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_marshal_policy(mut self, policy: MarshalPolicy) -> Self {
        self.marshal = policy;
        self
    }
}
