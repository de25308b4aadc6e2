use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::messaging::handler::{handler_fn, MessageHandler};

/// a handler that always returns the same value
pub fn constant_handler(value: Value) -> Arc<dyn MessageHandler> {
    handler_fn(move |_| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// a handler that returns its payload
pub fn echo_handler() -> Arc<dyn MessageHandler> {
    handler_fn(|payload| async move { Ok(payload) })
}

/// a handler that always fails with the given message
pub fn failing_handler(message: &str) -> Arc<dyn MessageHandler> {
    let message = message.to_string();
    handler_fn(move |_| {
        let message = message.clone();
        async move { Err(anyhow!(message)) }
    })
}

/// A handler that passes every payload it receives to the returned receiver, and returns
///  `null`.
pub fn recording_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Value>) {
    let (send, recv) = mpsc::unbounded_channel();
    let handler = handler_fn(move |payload| {
        let send = send.clone();
        async move {
            let _ = send.send(payload);
            Ok(Value::Null)
        }
    });
    (handler, recv)
}
