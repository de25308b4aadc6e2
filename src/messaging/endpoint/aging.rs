use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::messaging::address::Address;
use crate::messaging::endpoint::Endpoint;
use crate::messaging::endpoint_events::{ConnectionExpiredData, EndpointEvent};
use crate::messaging::handler::invoke_all;
use crate::messaging::message_name::{MessageName, DISCONNECTED_MESSAGE};

impl Endpoint {
    /// Starts or stops the periodic aging of connections. Every `age_interval`, each
    ///  connection's age grows by the interval, and connections older than `age_max` are
    ///  evicted. Receiving a packet from a connection resets its age.
    ///
    /// The task holds a weak reference only, so it does not keep the endpoint alive.
    pub fn enable_aging(self: &Arc<Self>, enabled: bool) {
        let mut task = self.aging_task.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !enabled {
            if let Some(handle) = task.take() {
                debug!("stopping connection aging");
                handle.abort();
            }
            return;
        }
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let interval = self.config.age_interval;
        let endpoint = Arc::downgrade(self);
        debug!("aging connections every {:?}", interval);

        *task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            // the first tick completes immediately
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                endpoint.age_connections(interval).await;
            }
        }));
    }

    pub fn is_aging(&self) -> bool {
        self.aging_task.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops all background activity of this endpoint.
    pub fn shutdown(&self) {
        info!("shutting down endpoint {:?}", self.address.get());
        self.stop_aging();
    }

    pub(super) fn stop_aging(&self) {
        let handle = self.aging_task.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn age_connections(&self, elapsed: Duration) {
        let expired = {
            let mut tables = self.tables.write().await;
            let age_max = self.config.age_max;
            let mut expired = tables.connections.iter_mut()
                .filter_map(|(address, connection)| {
                    connection.age += elapsed;
                    (connection.age > age_max).then(|| address.clone())
                })
                .collect::<Vec<_>>();
            expired.sort();
            expired
        };

        for address in expired {
            if let Err(e) = self.evict(&address).await {
                warn!("could not evict expired connection {:?}: {:#}", address, e);
            }
        }
    }

    /// Closes the transport, removes the connection with its routes, and lets local handlers
    ///  of the disconnect message know, in that order.
    async fn evict(&self, address: &Address) -> anyhow::Result<()> {
        let link = self.tables.read().await.connections.get(address)
            .map(|connection| connection.link.clone());
        let Some(link) = link else {
            return Ok(());
        };

        info!("connection {:?} expired", address);
        link.close().await;
        self.remove_connection(address).await?;

        let handlers = self.local_handlers(&MessageName::new(DISCONNECTED_MESSAGE)?).await;
        if !handlers.is_empty() {
            let payload = json!({ "address": address, "reason": "expired" });
            if let Err(e) = invoke_all(handlers, &payload).await {
                warn!("disconnect handler for {:?} failed: {:#}", address, e);
            }
        }

        self.events.send_event(EndpointEvent::ConnectionExpired(ConnectionExpiredData { address: address.clone() }));
        Ok(())
    }
}
