use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::address::Address;
use crate::messaging::packet::TransactionKey;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointEvent {
    ConnectionAdded(ConnectionAddedData),
    ConnectionRemoved(ConnectionRemovedData),
    ConnectionExpired(ConnectionExpiredData),
    TransactionResolved(TransactionResolvedData),
    /// a response arrived for which no transaction is pending, e.g. after a timeout
    UnmatchedResponse(UnmatchedResponseData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionAddedData {
    pub address: Address,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionRemovedData {
    pub address: Address,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionExpiredData {
    pub address: Address,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionResolvedData {
    pub key: TransactionKey,
    /// the complete path of the returned packet, ending with this endpoint
    pub hops: Vec<Address>,
    pub is_error: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnmatchedResponseData {
    pub key: TransactionKey,
}


pub struct EndpointEventNotifier {
    sender: broadcast::Sender<EndpointEvent>,
}
impl EndpointEventNotifier {
    pub fn new(capacity: usize) -> EndpointEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        EndpointEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: EndpointEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
