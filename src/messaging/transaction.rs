use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::messaging::error::EndpointError;
use crate::messaging::packet::TransactionKey;

pub type Resolver = oneshot::Sender<anyhow::Result<Value>>;

/// A registered transaction, waiting for its response
pub struct PendingTransaction {
    pub key: TransactionKey,
    pub receiver: oneshot::Receiver<anyhow::Result<Value>>,
}

/// Requests that are waiting for their response, keyed by the request's correlation key.
///
/// Entries are removed when they are resolved, so every transaction is resolved at most once.
#[derive(Default)]
pub struct TransactionTable {
    pending: FxHashMap<TransactionKey, Resolver>,
}

impl TransactionTable {
    pub fn register(&mut self, key: TransactionKey) -> Result<PendingTransaction, EndpointError> {
        if self.pending.contains_key(&key) {
            return Err(EndpointError::DuplicateTransaction(key.to_string()));
        }
        let (resolver, receiver) = oneshot::channel();
        self.pending.insert(key.clone(), resolver);
        Ok(PendingTransaction { key, receiver })
    }

    pub fn take(&mut self, key: &TransactionKey) -> Option<Resolver> {
        self.pending.remove(key)
    }

    pub fn remove(&mut self, key: &TransactionKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<TransactionKey> {
        let mut keys = self.pending.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}
