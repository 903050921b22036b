//! # Work Contexts
//!
//! Where inbound invocations execute.
//!
//! A serial context runs one invocation at a time, in arrival order. Each
//! request carries the chain of serial contexts suspended on its logical
//! call; a request that arrives at a context already on its chain is a
//! reentry and is handled by `ReentryPolicy` instead of being queued behind
//! the call it is nested in.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use remorpc::ErrorEnvelope;

use crate::error::Error;
use crate::error::Result;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WorkContext {
    /// One logical queue per service.
    #[default]
    Serial,
    /// One task per request; objects must tolerate reentrancy.
    Concurrent,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReentryPolicy {
    /// Run the reentrant request immediately, outside the queue.
    #[default]
    Inline,
    /// Fail the reentrant request with `ReentrantDeadlock`.
    Reject,
}

tokio::task_local! {
    static CALL_CHAIN: Vec<u64>;
}

/// Serial contexts the current task is nested in; empty outside any invocation.
pub(crate) fn current_chain() -> Vec<u64> {
    CALL_CHAIN.try_with(|chain| chain.clone()).unwrap_or_default()
}

type Job = BoxFuture<'static, ()>;

pub(crate) struct Executor {
    context: WorkContext,
    reentry: ReentryPolicy,
    id: u64,
    queue: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl Executor {
    pub fn new(context: WorkContext, reentry: ReentryPolicy) -> Self {
        Self {
            context,
            reentry,
            id: rand::random(),
            queue: OnceLock::new(),
        }
    }

    /// Runs `fut` on this context with `chain` as its call chain.
    pub async fn run<F>(&self, chain: Vec<u64>, fut: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.context {
            WorkContext::Concurrent => CALL_CHAIN.scope(chain, guarded(fut)).await,
            WorkContext::Serial if chain.contains(&self.id) => match self.reentry {
                ReentryPolicy::Inline => {
                    debug!(context = self.id, "reentrant call runs inline");
                    CALL_CHAIN.scope(chain, guarded(fut)).await
                }
                ReentryPolicy::Reject => Err(Error::ReentrantDeadlock),
            },
            WorkContext::Serial => {
                let mut chain = chain;
                chain.push(self.id);

                let (tx, rx) = oneshot::channel();
                let job = CALL_CHAIN
                    .scope(chain, guarded(fut))
                    .map(move |out| {
                        let _ = tx.send(out);
                    })
                    .boxed();

                self.queue()
                    .send(job)
                    .map_err(|_| Error::ConnectionLost("serial context stopped".into()))?;
                match rx.await {
                    Ok(out) => out,
                    Err(_) => Err(Error::ConnectionLost("serial context dropped the call".into())),
                }
            }
        }
    }

    fn queue(&self) -> &mpsc::UnboundedSender<Job> {
        self.queue.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
            });
            tx
        })
    }
}

/// Polls `fut`, reporting a panic as an application error instead of
/// unwinding into the worker that runs it.
async fn guarded<F: Future>(fut: F) -> Result<F::Output> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(%message, "invoked method panicked");
        Error::Remote(ErrorEnvelope::new("panic", "Panic", message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "method panicked".to_string()
    }
}
