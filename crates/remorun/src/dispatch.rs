//! # Invocation Dispatcher
//!
//! Turns an inbound `Call` into a `Reply`.
//!
//! Every step that can fail becomes a fault on the reply rather than an
//! error on the connection: an unknown target, an unsupported selector or a
//! method that raises are all answered, and the connection keeps serving.

use std::sync::Arc;

use tracing::debug;

use remorpc::Call;
use remorpc::Fault;
use remorpc::Position;
use remorpc::Reply;

use crate::config::MarshalPolicy;
use crate::connection::Connection;
use crate::context::Executor;
use crate::context::ReentryPolicy;
use crate::context::WorkContext;
use crate::error::Error;
use crate::marshal;
use crate::registry::ObjectId;
use crate::registry::Registry;
use crate::value::Args;

pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    executor: Executor,
    policy: MarshalPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, context: WorkContext, reentry: ReentryPolicy, policy: MarshalPolicy) -> Self {
        Self {
            registry,
            executor: Executor::new(context, reentry),
            policy,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> &MarshalPolicy {
        &self.policy
    }

    pub async fn dispatch(&self, conn: &Arc<Connection>, call: Call) -> Reply {
        let seq = call.seq;
        match self.serve(conn, call).await {
            Ok(reply) => reply,
            Err(fault) => {
                debug!(connection = %conn.id(), seq, %fault, "call faulted");
                Reply::fault(seq, fault)
            }
        }
    }

    async fn serve(&self, conn: &Arc<Connection>, call: Call) -> Result<Reply, Fault> {
        let target = ObjectId(call.target);
        let object = self.registry.resolve(target).map_err(Error::into_fault)?;

        let Some(capability) = object.capability(&call.selector) else {
            return Err(Fault::SelectorNotSupported {
                selector: call.selector,
                type_name: object.type_name().to_string(),
            });
        };

        let wire_args = call
            .args(capability.params.as_deref())
            .map_err(|e| Fault::BadArguments(e.to_string()))?;
        let args = wire_args
            .into_iter()
            .map(|wire| marshal::from_wire(conn, wire))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                Error::Protocol(e) => Fault::BadArguments(e.to_string()),
                other => other.into_fault(),
            })?;

        debug!(
            connection = %conn.id(),
            seq = call.seq,
            target = %target,
            selector = %call.selector,
            args = args.len(),
            "dispatching"
        );

        let selector = call.selector;
        let invocation = async move { object.invoke(&selector, Args::new(args)).await };
        let value = match self.executor.run(call.chain, invocation).await {
            Ok(Ok(value)) => value,
            Ok(Err(failure)) => return Err(failure.into_fault()),
            Err(e) => return Err(e.into_fault()),
        };

        let wire = marshal::to_wire(conn, &value, Position::ReturnValue).map_err(Error::into_fault)?;
        Reply::ok(call.seq, &wire).map_err(|e| Fault::NotSerializable {
            position: Position::ReturnValue,
            reason: e.to_string(),
        })
    }
}
