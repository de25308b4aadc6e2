use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tracing::{debug, warn};

use crate::messaging::endpoint::Endpoint;
use crate::messaging::error::EndpointError;
use crate::messaging::handler::{invoke_all, normalize, spawn_all};
use crate::messaging::message_name::MessageName;
use crate::messaging::packet::{CallKind, TransactionKey};
use crate::messaging::transaction::PendingTransaction;

/// Removes a transaction's entry when the caller stops waiting for it, be it because of a
///  timeout or because the caller's future was dropped. Entries that were resolved are gone
///  already, so this is a no-op for them.
struct TransactionGuard<'a> {
    endpoint: &'a Endpoint,
    key: TransactionKey,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.endpoint.transactions().remove(&self.key) {
            debug!("abandoned transaction {}", self.key);
        }
    }
}

impl Endpoint {
    /// Invokes all handlers for a message and returns their combined result: a single result
    ///  as is, several results as a list in handler order.
    ///
    /// Local-only messages are handled by local handlers exclusively. All other messages are
    ///  routed through the network, local handlers of this endpoint included.
    #[tracing::instrument(skip(self, data))]
    pub async fn call(self: &Arc<Self>, message: &str, data: Value) -> anyhow::Result<Value> {
        let message = MessageName::new(message)?;
        if message.is_local() {
            let handlers = self.local_handlers(&message).await;
            if handlers.is_empty() {
                return Err(EndpointError::NoHandler(message.to_string()).into());
            }
            return Ok(normalize(invoke_all(handlers, &data).await?));
        }
        self.net_request(message, data, CallKind::Call).await
    }

    /// Like [Endpoint::call], but only confirms that all handlers completed. Their results are
    ///  discarded by whoever ran them, so no result data travels back.
    #[tracing::instrument(skip(self, data))]
    pub async fn send(self: &Arc<Self>, message: &str, data: Value) -> anyhow::Result<()> {
        let message = MessageName::new(message)?;
        if message.is_local() {
            let handlers = self.local_handlers(&message).await;
            if handlers.is_empty() {
                return Err(EndpointError::NoHandler(message.to_string()).into());
            }
            invoke_all(handlers, &data).await?;
            return Ok(());
        }
        self.net_request(message, data, CallKind::Send).await?;
        Ok(())
    }

    /// Fire-and-forget: handlers are started but not awaited, and nothing travels back. The
    ///  result reports precondition violations only, handler failures are logged wherever they
    ///  happen.
    #[tracing::instrument(skip(self, data))]
    pub async fn signal(self: &Arc<Self>, message: &str, data: Value) -> anyhow::Result<()> {
        let message = MessageName::new(message)?;
        if message.is_local() {
            let handlers = self.local_handlers(&message).await;
            if handlers.is_empty() {
                warn!("no handler for signal {}", message);
            }
            spawn_all(handlers, &data, message.as_str()).await;
            return Ok(());
        }

        let mut packet = self.new_packet(message, data, CallKind::Signal)?;
        let own = packet.source.clone();
        packet.add_hop(&own);

        self.enqueue(None, packet);
        Ok(())
    }

    /// Counts the handlers for a message without invoking any of them. For network messages,
    ///  every endpoint the request reaches contributes its local handler count.
    #[tracing::instrument(skip(self))]
    pub async fn ping(self: &Arc<Self>, message: &str) -> anyhow::Result<u64> {
        let message = MessageName::new(message)?;
        if message.is_local() {
            return Ok(self.local_handlers(&message).await.len() as u64);
        }
        let result = self.net_request(message, Value::Null, CallKind::Ping).await?;
        result.as_u64()
            .ok_or_else(|| anyhow!("ping returned {} instead of a handler count", result))
    }

    /// Sends a request through this endpoint's own dispatch, which treats it like any request
    ///  coming in from the network. The loopback at the end of dispatch resolves the
    ///  transaction registered here.
    async fn net_request(self: &Arc<Self>, message: MessageName, data: Value, kind: CallKind) -> anyhow::Result<Value> {
        let mut packet = self.new_packet(message, data, kind)?;
        let pending = self.transactions().register(packet.transaction_key())?;
        let own = packet.source.clone();
        packet.add_hop(&own);

        let response = self.await_transaction(pending);
        self.enqueue(None, packet);
        response.await
    }

    /// Waits for a transaction's response, up to the configured timeout. The entry is released
    ///  when the returned future completes or is dropped, even if it was never polled.
    pub(super) fn await_transaction(&self, pending: PendingTransaction) -> impl Future<Output = anyhow::Result<Value>> + Send + '_ {
        let PendingTransaction { key, receiver } = pending;
        let guard = TransactionGuard { endpoint: self, key };
        let timeout = self.config.transaction_timeout;

        async move {
            let key = &guard.key;
            let received = match timeout {
                None => receiver.await,
                Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                    Ok(received) => received,
                    Err(_) => {
                        warn!("transaction {} timed out after {:?}", key, timeout);
                        return Err(EndpointError::Timeout(key.to_string()).into());
                    }
                },
            };

            match received {
                Ok(result) => result,
                Err(_) => Err(EndpointError::Disconnected(key.to_string()).into()),
            }
        }
    }
}
