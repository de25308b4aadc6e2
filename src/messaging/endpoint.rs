mod aging;
mod dispatch;
mod invocation;

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, OnceLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::messaging::address::{Address, AddressAllocator};
use crate::messaging::connection::{Authorizer, Connection, TokenPresentAuthorizer};
use crate::messaging::endpoint_config::EndpointConfig;
use crate::messaging::endpoint_events::{ConnectionAddedData, ConnectionRemovedData, EndpointEvent, EndpointEventNotifier};
use crate::messaging::error::EndpointError;
use crate::messaging::handler::MessageHandler;
use crate::messaging::message_name::MessageName;
use crate::messaging::packet::{CallKind, Packet, PacketId, TransactionKey};
use crate::messaging::transaction::TransactionTable;

use self::dispatch::QueuedRequest;

/// Result of [Endpoint::add_connection]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionAdded {
    /// the address assigned to the connection
    pub address: Address,
    /// the address the connection handle carried before, if any
    pub previous: Option<Address>,
}

#[derive(Default)]
struct RoutingTables {
    connections: FxHashMap<Address, Connection>,
    /// message -> addresses of connected peers that handle the message
    forward: FxHashMap<MessageName, BTreeSet<Address>>,
    /// message -> local handlers, in registration order
    handlers: FxHashMap<MessageName, Vec<Arc<dyn MessageHandler>>>,
}

impl RoutingTables {
    /// strips an address from all forward entries, returning the affected messages
    fn purge_forwards(&mut self, address: &Address) -> Vec<MessageName> {
        let mut affected = Vec::new();
        self.forward.retain(|message, addresses| {
            if addresses.remove(address) {
                affected.push(message.clone());
            }
            !addresses.is_empty()
        });
        affected.sort();
        affected
    }
}

fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
    // compare data pointers only: vtable pointers for the same type may differ between
    //  codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// An [Endpoint] is one participant in the message network. It originates messages
///  ([Endpoint::call], [Endpoint::send], [Endpoint::signal], [Endpoint::ping]), handles them
///  with locally registered handlers, forwards them to connected peers that declared they
///  handle them, and returns responses to where requests came from.
///
/// All routing state is owned by the endpoint, so several endpoints can live in one process.
///  Endpoints are always used through an `Arc` since request handling runs in spawned tasks.
pub struct Endpoint {
    config: EndpointConfig,
    address: OnceLock<Address>,
    packet_counter: AtomicU64,
    address_allocator: AddressAllocator,
    tables: RwLock<RoutingTables>,
    transactions: std::sync::Mutex<TransactionTable>,
    authorizer: Arc<dyn Authorizer>,
    events: EndpointEventNotifier,
    aging_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// feeds the task that dispatches requests one at a time, started on first use
    dispatch_queue: OnceLock<mpsc::UnboundedSender<QueuedRequest>>,
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint{{address:{:?}}}", self.address.get())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop_aging();
    }
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> anyhow::Result<Arc<Endpoint>> {
        Self::with_authorizer(config, Arc::new(TokenPresentAuthorizer))
    }

    pub fn with_authorizer(config: EndpointConfig, authorizer: Arc<dyn Authorizer>) -> anyhow::Result<Arc<Endpoint>> {
        config.validate()?;
        Ok(Arc::new(Endpoint {
            address_allocator: AddressAllocator::new(config.address_prefix.clone(), config.address_digits),
            events: EndpointEventNotifier::new(config.event_channel_capacity),
            config,
            address: OnceLock::new(),
            packet_counter: AtomicU64::new(0),
            tables: Default::default(),
            transactions: Default::default(),
            authorizer,
            aging_task: Default::default(),
            dispatch_queue: OnceLock::new(),
        }))
    }

    /// Assigns this endpoint's own address. This can happen only once - packets created before
    ///  would carry a stale source otherwise. Assigning the same address again is a no-op.
    pub fn set_address(&self, address: Address) -> anyhow::Result<()> {
        let current = self.address.get_or_init(|| address.clone());
        if current != &address {
            return Err(EndpointError::AddressAlreadySet(current.clone()).into());
        }
        info!("endpoint address is {}", address);
        Ok(())
    }

    pub fn address(&self) -> anyhow::Result<Address> {
        self.address.get()
            .cloned()
            .ok_or_else(|| EndpointError::AddressNotSet.into())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    fn transactions(&self) -> MutexGuard<'_, TransactionTable> {
        // the table is consistent after every single operation, so a panic elsewhere can not
        //  leave it half-modified
        self.transactions.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// keys of all transactions waiting for a response, sorted
    pub fn pending_transactions(&self) -> Vec<TransactionKey> {
        self.transactions().keys()
    }

    fn next_packet_id(&self) -> anyhow::Result<PacketId> {
        let origin = self.address()?;
        let seq = self.packet_counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(PacketId { origin, seq })
    }

    fn new_packet(&self, message: MessageName, payload: serde_json::Value, kind: CallKind) -> anyhow::Result<Packet> {
        Ok(Packet::new(self.next_packet_id()?, message, payload, kind))
    }

    /* connections ------------------------------------------------------------------------- */

    /// Registers a newly connected peer, assigning it a fresh address. The connection starts
    ///  out with age zero and without a credential.
    pub async fn add_connection(&self, mut connection: Connection) -> anyhow::Result<ConnectionAdded> {
        let mut tables = self.tables.write().await;

        let previous = connection.address.take();
        if let Some(previous) = &previous {
            if tables.connections.contains_key(previous) {
                return Err(EndpointError::DuplicateConnection(previous.clone()).into());
            }
        }

        let own = self.address.get();
        let address = loop {
            let candidate = self.address_allocator.allocate();
            if Some(&candidate) != own && !tables.connections.contains_key(&candidate) {
                break candidate;
            }
        };

        connection.address = Some(address.clone());
        connection.age = Duration::ZERO;
        connection.auth_token = None;
        tables.connections.insert(address.clone(), connection);
        drop(tables);

        debug!(?address, ?previous, "connection registered");
        self.events.send_event(EndpointEvent::ConnectionAdded(ConnectionAddedData { address: address.clone() }));
        Ok(ConnectionAdded { address, previous })
    }

    /// Removes a connection and every forward entry pointing to it. Both happen under the same
    ///  lock, forward entries first, so dispatch never sees a route to a removed connection.
    pub async fn remove_connection(&self, address: &Address) -> anyhow::Result<Address> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(address) {
            return Err(EndpointError::UnknownAddress(address.clone()).into());
        }
        let purged = tables.purge_forwards(address);
        tables.connections.remove(address);
        drop(tables);

        debug!(?address, ?purged, "connection removed");
        self.events.send_event(EndpointEvent::ConnectionRemoved(ConnectionRemovedData { address: address.clone() }));
        Ok(address.clone())
    }

    pub async fn set_auth_token(&self, address: &Address, token: impl Into<String>) -> anyhow::Result<()> {
        match self.tables.write().await.connections.get_mut(address) {
            Some(connection) => {
                connection.auth_token = Some(token.into());
                Ok(())
            }
            None => Err(EndpointError::UnknownAddress(address.clone()).into()),
        }
    }

    /// true if traffic from the connection is admitted - false for unknown addresses
    pub async fn authorize(&self, address: &Address) -> bool {
        match self.tables.read().await.connections.get(address) {
            Some(connection) => self.authorizer.authorize(connection),
            None => false,
        }
    }

    pub async fn connection_addresses(&self) -> Vec<Address> {
        let mut result = self.tables.read().await.connections.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn connection_age(&self, address: &Address) -> Option<Duration> {
        self.tables.read().await.connections.get(address).map(|c| c.age)
    }

    /* message registration ---------------------------------------------------------------- */

    pub async fn register_handler(&self, message: &str, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let message = MessageName::new(message)?;
        let mut tables = self.tables.write().await;
        let handlers = tables.handlers.entry(message.clone()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            debug!("handler for {} is already registered", message);
            return Ok(());
        }
        handlers.push(handler);
        debug!("registered handler #{} for {}", handlers.len(), message);
        Ok(())
    }

    pub async fn unregister_handler(&self, message: &str, handler: &Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let message = MessageName::new(message)?;
        let mut tables = self.tables.write().await;
        let Some(handlers) = tables.handlers.get_mut(&message) else {
            return Err(EndpointError::UnknownMessage(message.to_string()).into());
        };
        handlers.retain(|h| !same_handler(h, handler));
        if handlers.is_empty() {
            tables.handlers.remove(&message);
        }
        Ok(())
    }

    /// Declares that the peer at `address` handles the given messages, so requests for them
    ///  are forwarded there. All names are validated before any of them is registered.
    pub async fn register_remote_messages<I>(&self, address: &Address, messages: I) -> anyhow::Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let messages = messages.into_iter()
            .map(|m| MessageName::new(m.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(local) = messages.iter().find(|m| m.is_local()) {
            return Err(EndpointError::LocalOnlyMessage(local.to_string()).into());
        }

        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(address) {
            return Err(EndpointError::UnknownAddress(address.clone()).into());
        }
        for message in messages {
            tables.forward.entry(message)
                .or_default()
                .insert(address.clone());
        }
        Ok(())
    }

    /// Strips `address` from all forward entries, returning the affected messages.
    pub async fn remove_remote(&self, address: &Address) -> anyhow::Result<Vec<MessageName>> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(address) {
            return Err(EndpointError::UnknownAddress(address.clone()).into());
        }
        let removed = tables.purge_forwards(address);
        if removed.is_empty() {
            warn!("{:?} had no remote messages registered", address);
        }
        Ok(removed)
    }

    pub async fn messages_for_address(&self, address: &Address) -> anyhow::Result<Vec<MessageName>> {
        let tables = self.tables.read().await;
        if !tables.connections.contains_key(address) {
            return Err(EndpointError::UnknownAddress(address.clone()).into());
        }
        let mut result = tables.forward.iter()
            .filter(|(_, addresses)| addresses.contains(address))
            .map(|(message, _)| message.clone())
            .collect::<Vec<_>>();
        result.sort();
        Ok(result)
    }

    pub async fn remote_addresses(&self, message: &str) -> anyhow::Result<Vec<Address>> {
        let message = MessageName::new(message)?;
        Ok(self.tables.read().await.forward.get(&message)
            .map(|addresses| addresses.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn local_handler_count(&self, message: &str) -> anyhow::Result<usize> {
        let message = MessageName::new(message)?;
        Ok(self.tables.read().await.handlers.get(&message)
            .map(|h| h.len())
            .unwrap_or(0))
    }

    /// The network messages this endpoint can service, either with local handlers or by
    ///  forwarding. This is the list to send to a peer during a capability exchange.
    pub async fn advertised_messages(&self) -> Vec<MessageName> {
        let tables = self.tables.read().await;
        let result = tables.handlers.keys()
            .chain(tables.forward.keys())
            .filter(|m| !m.is_local())
            .cloned()
            .collect::<BTreeSet<_>>();
        result.into_iter().collect()
    }

    async fn local_handlers(&self, message: &MessageName) -> Vec<Arc<dyn MessageHandler>> {
        self.tables.read().await.handlers.get(message)
            .cloned()
            .unwrap_or_default()
    }
}
