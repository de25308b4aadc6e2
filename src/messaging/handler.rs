use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::messaging::error::EndpointError;

/// A local handler for a message. Every invocation receives its own copy of the payload.
///
/// Handlers are registered as `Arc<dyn MessageHandler>`, and the `Arc`'s identity is what
///  registration and deregistration use - registering the same `Arc` twice has no effect.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        (self.0)(payload).await
    }
}

/// convenience for creating a handler from an async closure
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A handler invocation that was started by [start_all]
pub enum Invocation {
    /// the handler completed without suspending
    Done(anyhow::Result<Value>),
    /// the remainder of the handler runs in its own task
    Running(JoinHandle<anyhow::Result<Value>>),
}

impl Invocation {
    pub async fn join(self) -> anyhow::Result<Value> {
        match self {
            Invocation::Done(result) => result,
            Invocation::Running(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(EndpointError::HandlerFailed(format!("handler task failed: {}", e)).into()),
            },
        }
    }
}

/// Starts all handlers in handler order, each with its own copy of `payload`. Every handler
///  runs up to its first suspension point before the next one is started, and whatever remains
///  of it continues in a spawned task. So handlers see requests in the order they are started
///  here, even on a multi-threaded runtime.
pub async fn start_all(handlers: Vec<Arc<dyn MessageHandler>>, payload: &Value) -> Vec<Invocation> {
    let mut invocations = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let payload = payload.clone();
        let mut invocation = AssertUnwindSafe(async move { handler.invoke(payload).await })
            .catch_unwind()
            .map(settle)
            .boxed();

        match futures::poll!(&mut invocation) {
            Poll::Ready(result) => invocations.push(Invocation::Done(result)),
            Poll::Pending => invocations.push(Invocation::Running(tokio::spawn(invocation))),
        }
    }
    invocations
}

fn settle(outcome: Result<anyhow::Result<Value>, Box<dyn Any + Send>>) -> anyhow::Result<Value> {
    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(handler_failure(e)),
        Err(_) => Err(EndpointError::HandlerFailed("handler panicked".to_string()).into()),
    }
}

/// Waits for started handlers and returns their results in handler order.
///
/// The first failure fails the whole invocation. Handlers that are still running at that point
///  are left to finish on their own, and their results are discarded.
pub async fn join_started(invocations: Vec<Invocation>) -> anyhow::Result<Vec<Value>> {
    try_join_all(invocations.into_iter().map(Invocation::join)).await
}

/// Invokes all handlers concurrently, see [start_all] and [join_started].
pub async fn invoke_all(handlers: Vec<Arc<dyn MessageHandler>>, payload: &Value) -> anyhow::Result<Vec<Value>> {
    join_started(start_all(handlers, payload).await).await
}

/// Starts all handlers without waiting for them to finish. Failures can only be logged.
pub async fn spawn_all(handlers: Vec<Arc<dyn MessageHandler>>, payload: &Value, context: &str) {
    let invocations = start_all(handlers, payload).await;
    if invocations.is_empty() {
        return;
    }
    let context = context.to_string();
    tokio::spawn(async move {
        for invocation in invocations {
            if let Err(e) = invocation.join().await {
                warn!("handler for {} failed: {:#}", context, e);
            }
        }
    });
}

fn handler_failure(e: anyhow::Error) -> anyhow::Error {
    // errors raised by the messaging layer itself (e.g. a handler relaying a remote error)
    //  travel unchanged
    if e.is::<EndpointError>() {
        return e;
    }
    EndpointError::HandlerFailed(format!("{:#}", e)).into()
}

/// A single result is returned as is, several results as a list.
pub fn normalize(mut results: Vec<Value>) -> Value {
    trace!("normalizing {} results", results.len());
    if results.len() == 1 {
        return results.remove(0);
    }
    Value::Array(results)
}
