use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::{self, try_join_all};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messaging::address::Address;
use crate::messaging::endpoint::Endpoint;
use crate::messaging::endpoint_events::{EndpointEvent, TransactionResolvedData, UnmatchedResponseData};
use crate::messaging::error::{error_value, EndpointError};
use crate::messaging::handler::{join_started, normalize, start_all, Invocation};
use crate::messaging::packet::{CallKind, Packet};
use crate::messaging::transaction::PendingTransaction;

/// What to do with an incoming packet. Every packet falls into exactly one category.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Disposition {
    /// a response to one of this endpoint's transactions
    Resolve,
    /// a response that does not belong to this endpoint
    Drop,
    /// a request, to be handled locally and / or forwarded
    Route,
}

/// A request waiting for dispatch, together with the connection it arrived on. Requests that
///  originate at this endpoint have no arrival connection.
pub(super) struct QueuedRequest {
    from: Option<Address>,
    packet: Packet,
}

/// A request whose local handlers and forward legs were started
struct Started {
    local: Vec<Invocation>,
    /// per forward target: the transaction waiting for the peer's result, if any
    legs: Vec<anyhow::Result<Option<PendingTransaction>>>,
}

impl Endpoint {
    /// Entry point for transports: decodes raw bytes received on the connection `from`.
    pub async fn wire_in(self: &Arc<Self>, from: &Address, raw: &[u8]) -> anyhow::Result<()> {
        let packet = Packet::try_deser(raw)?;
        self.receive_packet(from, packet).await
    }

    /// Accepts a packet received on the connection `from`. Responses are resolved right away,
    ///  requests are queued for dispatch. Requests are dispatched in the order they are handed
    ///  to this function, while slow handlers do not hold up further inbound traffic.
    #[tracing::instrument(skip(self, packet), fields(id = %packet.id, message = %packet.message))]
    pub async fn receive_packet(self: &Arc<Self>, from: &Address, packet: Packet) -> anyhow::Result<()> {
        {
            let mut tables = self.tables.write().await;
            let Some(connection) = tables.connections.get_mut(from) else {
                return Err(EndpointError::NotAuthorized(from.clone()).into());
            };
            if !self.authorizer.authorize(connection) {
                return Err(EndpointError::NotAuthorized(from.clone()).into());
            }
            connection.age = Duration::ZERO;
        }

        if packet.message.is_local() {
            return Err(EndpointError::LocalOnlyMessage(packet.message.to_string()).into());
        }

        match self.classify(&packet) {
            Disposition::Resolve => self.resolve_transaction(packet),
            Disposition::Drop => {
                warn!("dropping response {} from {:?}: not a transaction of this endpoint", packet.transaction_key(), from);
            }
            Disposition::Route => self.enqueue(Some(from.clone()), packet),
        }
        Ok(())
    }

    /// Queues a request for dispatch. A single task per endpoint takes requests off the queue
    ///  one at a time, starts their local handlers and forward legs, and leaves waiting for the
    ///  results to a separate task per request.
    pub(super) fn enqueue(self: &Arc<Self>, from: Option<Address>, packet: Packet) {
        let queue = self.dispatch_queue.get_or_init(|| self.spawn_dispatch_loop());
        if queue.send(QueuedRequest { from, packet }).is_err() {
            warn!("dispatch loop is gone - dropping request");
        }
    }

    fn spawn_dispatch_loop(self: &Arc<Self>) -> mpsc::UnboundedSender<QueuedRequest> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedRequest>();
        let endpoint = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(QueuedRequest { from, packet }) = receiver.recv().await {
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                let started = endpoint.start_request(from.as_ref(), &packet).await;
                tokio::spawn(endpoint.finish_request(from, packet, started));
            }
            debug!("dispatch loop terminated");
        });
        sender
    }

    fn classify(&self, packet: &Packet) -> Disposition {
        if !packet.is_response() {
            return Disposition::Route;
        }
        if packet.rsvp && self.address.get() == Some(&packet.source) {
            Disposition::Resolve
        }
        else {
            Disposition::Drop
        }
    }

    fn is_loopback(&self, packet: &Packet) -> bool {
        self.address.get() == Some(&packet.source) && packet.hops.len() == 1
    }

    /// A request coming in from the network that lists this endpoint among its hops has
    ///  travelled in a circle.
    fn is_routing_loop(&self, from: Option<&Address>, packet: &Packet) -> bool {
        from.is_some() && self.address.get().is_some_and(|own| packet.hops.contains(own))
    }

    /// Hands a response to the caller waiting for it. The caller may have given up already,
    ///  which is not an error.
    fn resolve_transaction(&self, mut packet: Packet) {
        if let Some(own) = self.address.get() {
            packet.add_hop(own);
        }
        let key = packet.transaction_key();

        let resolver = self.transactions().take(&key);
        let Some(resolver) = resolver else {
            warn!("no pending transaction for response {} - ignoring", key);
            self.events.send_event(EndpointEvent::UnmatchedResponse(UnmatchedResponseData { key }));
            return;
        };

        let hops = packet.hops.clone();
        let result = match packet.error() {
            Some(error) => Err(EndpointError::Remote(error.clone()).into()),
            None => Ok(packet.into_result_payload()),
        };
        let is_error = result.is_err();
        if resolver.send(result).is_err() {
            debug!("caller of {} stopped waiting", key);
        }
        self.events.send_event(EndpointEvent::TransactionResolved(TransactionResolvedData { key, hops, is_error }));
    }

    /// Starts local handlers and forward legs for a request, in that order. The arrival
    ///  connection is never a forward target.
    async fn start_request(&self, from: Option<&Address>, packet: &Packet) -> anyhow::Result<Started> {
        if self.is_routing_loop(from, packet) {
            debug!("request {} came back along {:?}", packet.id, packet.hops);
            // this endpoint's handlers were counted on the first pass
            if packet.kind == CallKind::Ping {
                return Ok(Started { local: vec![Invocation::Done(Ok(json!(0)))], legs: Vec::new() });
            }
            return Err(EndpointError::RoutingLoop(packet.id.to_string()).into());
        }

        let (handlers, targets) = {
            let tables = self.tables.read().await;
            let handlers = tables.handlers.get(&packet.message)
                .cloned()
                .unwrap_or_default();
            let targets = tables.forward.get(&packet.message)
                .map(|addresses| addresses.iter()
                    .filter(|a| Some(*a) != from)
                    .cloned()
                    .collect::<Vec<_>>())
                .unwrap_or_default();
            (handlers, targets)
        };
        trace!("{} local handlers, forwarding to {:?}", handlers.len(), targets);

        // zero is a valid handler count
        if handlers.is_empty() && targets.is_empty() && packet.kind != CallKind::Ping {
            return Err(EndpointError::NoHandler(packet.message.to_string()).into());
        }

        let local = match packet.kind {
            CallKind::Ping => vec![Invocation::Done(Ok(json!(handlers.len())))],
            _ => start_all(handlers, &packet.payload).await,
        };
        let mut legs = Vec::with_capacity(targets.len());
        for target in &targets {
            legs.push(self.start_leg(target, packet).await);
        }
        Ok(Started { local, legs })
    }

    /// Sends a clone of a request to one peer. For requests that expect a response, the clone
    ///  gets its own transaction.
    async fn start_leg(&self, target: &Address, packet: &Packet) -> anyhow::Result<Option<PendingTransaction>> {
        let mut clone = packet.clone_with_id(self.next_packet_id()?)?;
        let own = clone.source.clone();
        clone.add_hop(&own);
        debug!("forwarding {} to {:?} as {}", packet.id, target, clone.id);

        if !clone.rsvp {
            self.send_to(target, &clone).await?;
            return Ok(None);
        }

        let pending = self.transactions().register(clone.transaction_key())?;
        if let Err(e) = self.send_to(target, &clone).await {
            self.transactions().remove(&pending.key);
            return Err(e);
        }
        Ok(Some(pending))
    }

    /// Waits for a started request's results and combines them: local results in handler order,
    ///  followed by forward-leg results in address order.
    async fn collect(&self, kind: CallKind, started: Started) -> anyhow::Result<Value> {
        let Started { local, legs } = started;

        // transactions are watched right away, so none is left behind if another leg fails first
        let remote = legs.into_iter()
            .map(|leg| match leg {
                Ok(Some(pending)) => self.await_transaction(pending).left_future(),
                Ok(None) => future::ready(Ok(Value::Null)).right_future(),
                Err(e) => future::ready(Err(e)).right_future(),
            })
            .collect::<Vec<_>>();

        let (mut results, remote) = tokio::try_join!(join_started(local), try_join_all(remote))?;
        results.extend(remote);
        combine(kind, results)
    }

    /// Delivers the combined result of a request: to the waiting caller if the request
    ///  originated here, back along the arrival connection otherwise.
    async fn finish_request(self: Arc<Self>, from: Option<Address>, mut packet: Packet, started: anyhow::Result<Started>) {
        let result = match started {
            Ok(started) => self.collect(packet.kind, started).await,
            Err(e) => Err(e),
        };

        if self.is_loopback(&packet) {
            self.resolve_loopback(packet, result);
            return;
        }

        if !packet.rsvp {
            if let Err(e) = result {
                warn!("signal {} failed: {:#}", packet.id, e);
            }
            return;
        }

        let Some(from) = from else {
            warn!("request {} has no connection to respond through", packet.id);
            return;
        };

        packet.payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                debug!("request {} failed: {:#}", packet.id, e);
                json!({ "error": error_value(&e) })
            }
        };
        if let Err(e) = packet.set_response() {
            warn!("{}", e);
            return;
        }
        if let Some(own) = self.address.get() {
            packet.add_hop(own);
        }
        if let Err(e) = self.send_to(&from, &packet).await {
            warn!("could not return response {} to {:?}: {:#}", packet.id, from, e);
        }
    }

    /// A request that originated here and was never sent: the result goes straight to the
    ///  waiting caller, without a round trip through the wire.
    fn resolve_loopback(&self, packet: Packet, result: anyhow::Result<Value>) {
        let key = packet.transaction_key();
        let resolver = self.transactions().take(&key);

        match resolver {
            Some(resolver) => {
                trace!("loopback resolution of {}", key);
                let is_error = result.is_err();
                if resolver.send(result).is_err() {
                    debug!("caller of {} stopped waiting", key);
                }
                self.events.send_event(EndpointEvent::TransactionResolved(TransactionResolvedData {
                    key,
                    hops: packet.hops,
                    is_error,
                }));
            }
            None => match result {
                Err(e) if !packet.rsvp => warn!("signal {} failed: {:#}", packet.message, e),
                Err(e) => debug!("caller of {} stopped waiting, discarding error {:#}", key, e),
                Ok(_) => {}
            }
        }
    }

    async fn send_to(&self, target: &Address, packet: &Packet) -> anyhow::Result<()> {
        let link = self.tables.read().await.connections.get(target)
            .map(|connection| connection.link.clone());
        let Some(link) = link else {
            return Err(EndpointError::UnknownAddress(target.clone()).into());
        };
        trace!("sending {} to {:?}", packet.id, target);
        link.wire_out(packet).await
    }
}

/// Combines local results (in handler order) and forward-leg results (in address order) into
///  the payload of the response.
fn combine(kind: CallKind, results: Vec<Value>) -> anyhow::Result<Value> {
    match kind {
        CallKind::Call => Ok(normalize(results)),
        CallKind::Send | CallKind::Signal => Ok(Value::Null),
        CallKind::Ping => {
            let count = results.iter()
                .map(|v| v.as_u64().ok_or_else(|| anyhow!("{} is not a handler count", v)))
                .sum::<anyhow::Result<u64>>()?;
            Ok(json!(count))
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;
    use serde_json::json;

    use crate::messaging::connection::Connection;
    use crate::messaging::endpoint_config::EndpointConfig;
    use crate::messaging::message_name::MessageName;
    use crate::messaging::packet::{Direction, PacketId};
    use crate::messaging::transport::local::LocalLink;
    use crate::messaging::transport::MockWireOut;
    use crate::test_util::handler::{constant_handler, echo_handler, failing_handler, recording_handler};
    use crate::test_util::node::{connect_recording, test_endpoint};
    use crate::test_util::wire::RecordingWireOut;

    use super::*;

    fn endpoint_error(e: &anyhow::Error) -> &EndpointError {
        e.downcast_ref::<EndpointError>().expect("an EndpointError")
    }

    fn request(origin: &str, seq: u64, message: &str, payload: Value, kind: CallKind) -> Packet {
        let mut packet = Packet::new(
            PacketId { origin: origin.into(), seq },
            MessageName::new(message).unwrap(),
            payload,
            kind,
        );
        packet.add_hop(&origin.into());
        packet
    }

    /// answers a forwarded request the way a peer with a single handler would
    fn respond(mut packet: Packet, peer: &str, payload: Value) -> Packet {
        packet.set_response().unwrap();
        packet.add_hop(&peer.into());
        packet.payload = payload;
        packet
    }

    fn resolved_hops(events: &mut tokio::sync::broadcast::Receiver<EndpointEvent>) -> Vec<Vec<Address>> {
        let mut result = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EndpointEvent::TransactionResolved(data) = event {
                result.push(data.hops);
            }
        }
        result
    }

    #[rstest]
    #[case::call(CallKind::Call, vec![json!(1)], json!(1))]
    #[case::call_list(CallKind::Call, vec![json!(1), json!("x")], json!([1, "x"]))]
    #[case::send(CallKind::Send, vec![json!(1), json!(2)], Value::Null)]
    #[case::ping(CallKind::Ping, vec![json!(1), json!(0), json!(3)], json!(4))]
    fn test_combine(#[case] kind: CallKind, #[case] results: Vec<Value>, #[case] expected: Value) {
        assert_eq!(combine(kind, results).unwrap(), expected);
    }

    #[test]
    fn test_combine_rejects_bad_ping_count() {
        assert!(combine(CallKind::Ping, vec![json!("three")]).is_err());
    }

    #[tokio::test]
    async fn test_remote_op_round_trip() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        let mut events = a.subscribe();
        b.register_handler("REMOTE_OP", constant_handler(json!({"v": 42}))).await.unwrap();

        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["REMOTE_OP"]).await.unwrap();

        let result = a.call("REMOTE_OP", json!({})).await.unwrap();
        assert_eq!(result, json!({"v": 42}));
        assert!(a.pending_transactions().is_empty());

        let hops = resolved_hops(&mut events);
        assert!(hops.contains(&vec![Address::from("UA001"), "UA002".into(), "UA001".into()]), "{:?}", hops);
    }

    #[tokio::test]
    async fn test_fan_out_to_two_remotes() {
        let endpoint = test_endpoint("UA001");
        let (x, link_x) = connect_recording(&endpoint).await;
        let (y, link_y) = connect_recording(&endpoint).await;
        endpoint.register_remote_messages(&x, ["FAN"]).await.unwrap();
        endpoint.register_remote_messages(&y, ["FAN"]).await.unwrap();

        let caller = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.call("FAN", json!({"q": 1})).await })
        };

        let to_x = link_x.wait_for_packets(1).await.remove(0);
        let to_y = link_y.wait_for_packets(1).await.remove(0);
        assert_ne!(to_x.transaction_key(), to_y.transaction_key());
        assert_eq!(endpoint.pending_transactions().len(), 3);
        assert_eq!(to_x.payload, json!({"q": 1}));
        assert_eq!(to_x.hops, vec![Address::from("UA001")]);

        // only one leg answered: the call is still pending
        endpoint.receive_packet(&y, respond(to_y, "UA003", json!("from y"))).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!caller.is_finished());

        endpoint.receive_packet(&x, respond(to_x, "UA002", json!("from x"))).await.unwrap();
        let result = caller.await.unwrap().unwrap();

        // forward legs are ordered by address
        assert_eq!(result, json!(["from x", "from y"]));
        assert!(endpoint.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_local_and_remote_results() {
        let endpoint = test_endpoint("UA001");
        let (remote, link) = connect_recording(&endpoint).await;
        endpoint.register_handler("MIXED", constant_handler(json!("local"))).await.unwrap();
        endpoint.register_remote_messages(&remote, ["MIXED"]).await.unwrap();

        let caller = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.call("MIXED", json!({})).await })
        };
        let forwarded = link.wait_for_packets(1).await.remove(0);
        endpoint.receive_packet(&remote, respond(forwarded, "UA002", json!("remote"))).await.unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), json!(["local", "remote"]));
    }

    #[tokio::test]
    async fn test_remote_error_rejects_caller() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        b.register_handler("BROKEN", failing_handler("disk full")).await.unwrap();
        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["BROKEN"]).await.unwrap();

        let e = a.call("BROKEN", json!({})).await.unwrap_err();
        assert!(
            matches!(endpoint_error(&e), EndpointError::Remote(v) if v == &json!("handler failed: disk full")),
            "{:?}", e,
        );
        assert!(a.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_multi_hop() {
        let x = test_endpoint("X");
        let hub = test_endpoint("HUB");
        let y = test_endpoint("Y");
        y.register_handler("FAR_OP", echo_handler()).await.unwrap();

        let (hub_on_x, _) = LocalLink::connect(&x, &hub).await.unwrap();
        let (y_on_hub, _) = LocalLink::connect(&hub, &y).await.unwrap();
        hub.register_remote_messages(&y_on_hub, ["FAR_OP"]).await.unwrap();
        x.register_remote_messages(&hub_on_x, hub.advertised_messages().await).await.unwrap();

        let result = x.call("FAR_OP", json!({"n": 7})).await.unwrap();
        assert_eq!(result, json!({"n": 7}));
        assert_eq!(x.ping("FAR_OP").await.unwrap(), 1);

        assert!(x.pending_transactions().is_empty());
        assert!(hub.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_request_is_not_forwarded_back() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        endpoint.register_remote_messages(&peer, ["ECHOED"]).await.unwrap();

        endpoint.receive_packet(&peer, request("UA050", 1, "ECHOED", json!({}), CallKind::Call)).await.unwrap();

        let sent = link.wait_for_packets(1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].direction, Direction::Response);
        assert_eq!(sent[0].id, PacketId { origin: "UA050".into(), seq: 1 });
        assert_eq!(sent[0].hops, vec![Address::from("UA050"), "UA001".into()]);
        assert_eq!(sent[0].error(), Some(&json!("no handler for message ECHOED")));
    }

    #[tokio::test]
    async fn test_relayed_request_is_answered() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        endpoint.register_handler("ADD", crate::messaging::handler::handler_fn(|payload: Value| async move {
            Ok(json!(payload["a"].as_i64().unwrap_or(0) + payload["b"].as_i64().unwrap_or(0)))
        })).await.unwrap();

        endpoint.receive_packet(&peer, request("UA050", 4, "ADD", json!({"a": 2, "b": 3}), CallKind::Call)).await.unwrap();

        let response = link.wait_for_packets(1).await.remove(0);
        assert!(response.is_response());
        assert_eq!(response.payload, json!(5));
        assert_eq!(response.transaction_key().as_str(), "UA050:UA050#4");
    }

    #[tokio::test]
    async fn test_send_response_carries_no_data() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        endpoint.register_handler("STORE", constant_handler(json!({"secret": 1}))).await.unwrap();

        endpoint.receive_packet(&peer, request("UA050", 1, "STORE", json!({}), CallKind::Send)).await.unwrap();

        let response = link.wait_for_packets(1).await.remove(0);
        assert_eq!(response.payload, Value::Null);
    }

    #[tokio::test]
    async fn test_ping_counts_without_invoking() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        let (recording, mut received) = recording_handler();
        endpoint.register_handler("COUNTED", recording).await.unwrap();
        endpoint.register_handler("COUNTED", constant_handler(json!(0))).await.unwrap();

        endpoint.receive_packet(&peer, request("UA050", 1, "COUNTED", Value::Null, CallKind::Ping)).await.unwrap();

        let response = link.wait_for_packets(1).await.remove(0);
        assert_eq!(response.payload, json!(2));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_network_ping_sums_counts() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        a.register_handler("COUNT_ME", constant_handler(json!(1))).await.unwrap();
        b.register_handler("COUNT_ME", constant_handler(json!(1))).await.unwrap();
        b.register_handler("COUNT_ME", constant_handler(json!(2))).await.unwrap();

        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["COUNT_ME"]).await.unwrap();

        assert_eq!(a.ping("COUNT_ME").await.unwrap(), 3);
        assert_eq!(b.ping("COUNT_ME").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ping_counts_zero_where_nobody_handles() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        a.register_handler("COUNT_ME", constant_handler(json!(1))).await.unwrap();

        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["COUNT_ME"]).await.unwrap();

        assert_eq!(a.ping("COUNT_ME").await.unwrap(), 1);
        assert_eq!(b.ping("COUNT_ME").await.unwrap(), 0);
        assert_eq!(a.ping("NOBODY").await.unwrap(), 0);
        assert!(a.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_relayed_ping_without_handlers_answers_zero() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;

        endpoint.receive_packet(&peer, request("UA050", 1, "NOBODY", Value::Null, CallKind::Ping)).await.unwrap();

        let response = link.wait_for_packets(1).await.remove(0);
        assert_eq!(response.error(), None);
        assert_eq!(response.payload, json!(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_are_dispatched_in_arrival_order() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        let (recording, mut received) = recording_handler();
        b.register_handler("SEQ", recording).await.unwrap();
        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["SEQ"]).await.unwrap();

        for i in 0..200 {
            a.signal("SEQ", json!(i)).await.unwrap();
        }
        for i in 0..200 {
            assert_eq!(received.recv().await.unwrap(), json!(i));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_handler_does_not_reorder_later_requests() {
        let endpoint = test_endpoint("UA001");
        let (peer, _link) = connect_recording(&endpoint).await;
        let (send, mut received) = tokio::sync::mpsc::unbounded_channel();
        endpoint.register_handler("SEQ", crate::messaging::handler::handler_fn(move |payload: Value| {
            let send = send.clone();
            async move {
                let _ = send.send(payload.clone());
                if payload == json!(0) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(Value::Null)
            }
        })).await.unwrap();

        for i in 0..50 {
            endpoint.receive_packet(&peer, request("UA050", i + 1, "SEQ", json!(i), CallKind::Signal)).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(received.recv().await.unwrap(), json!(i));
        }
    }

    /// X -> Y -> Z -> X, each forwarding `message` to the next
    async fn ring(message: &str) -> (Arc<Endpoint>, Arc<Endpoint>, Arc<Endpoint>) {
        let x = test_endpoint("X");
        let y = test_endpoint("Y");
        let z = test_endpoint("Z");
        let (y_on_x, _) = LocalLink::connect(&x, &y).await.unwrap();
        let (z_on_y, _) = LocalLink::connect(&y, &z).await.unwrap();
        let (x_on_z, _) = LocalLink::connect(&z, &x).await.unwrap();
        x.register_remote_messages(&y_on_x, [message]).await.unwrap();
        y.register_remote_messages(&z_on_y, [message]).await.unwrap();
        z.register_remote_messages(&x_on_z, [message]).await.unwrap();
        (x, y, z)
    }

    #[tokio::test]
    async fn test_cyclic_forwarding_is_refused() {
        let (x, y, z) = ring("CIRCULAR").await;

        let e = tokio::time::timeout(Duration::from_secs(5), x.call("CIRCULAR", json!({})))
            .await
            .expect("a cycle must not run into the transaction timeout")
            .unwrap_err();
        assert!(
            matches!(endpoint_error(&e), EndpointError::Remote(Value::String(msg)) if msg.contains("already passed through this endpoint")),
            "{:?}", e,
        );

        assert!(x.pending_transactions().is_empty());
        assert!(y.pending_transactions().is_empty());
        assert!(z.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_ping_around_a_cycle_counts_every_endpoint_once() {
        let (x, y, z) = ring("CIRCULAR").await;
        for endpoint in [&x, &y, &z] {
            endpoint.register_handler("CIRCULAR", constant_handler(json!(1))).await.unwrap();
        }

        assert_eq!(x.ping("CIRCULAR").await.unwrap(), 3);
        assert!(x.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_request_listing_own_address_is_answered_with_error() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        let (recording, mut received) = recording_handler();
        endpoint.register_handler("AGAIN", recording).await.unwrap();

        let mut packet = request("UA050", 1, "AGAIN", json!({}), CallKind::Call);
        packet.add_hop(&"UA001".into());
        packet.add_hop(&"UA060".into());
        endpoint.receive_packet(&peer, packet).await.unwrap();

        let response = link.wait_for_packets(1).await.remove(0);
        assert_eq!(response.error(), Some(&json!("request UA050#1 already passed through this endpoint")));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signal_is_forwarded_but_never_echoed() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        let (other, other_link) = connect_recording(&endpoint).await;
        let (recording, mut received) = recording_handler();
        endpoint.register_handler("BROADCAST", recording).await.unwrap();
        endpoint.register_remote_messages(&other, ["BROADCAST"]).await.unwrap();

        endpoint.receive_packet(&peer, request("UA050", 1, "BROADCAST", json!("news"), CallKind::Signal)).await.unwrap();

        assert_eq!(received.recv().await.unwrap(), json!("news"));
        let forwarded = other_link.wait_for_packets(1).await.remove(0);
        assert!(!forwarded.rsvp);
        assert_eq!(forwarded.source, Address::from("UA001"));
        assert_eq!(forwarded.hops, vec![Address::from("UA050"), "UA001".into()]);

        assert!(endpoint.pending_transactions().is_empty());
        assert!(link.sent_packets().await.is_empty());
    }

    #[tokio::test]
    async fn test_network_signal() {
        let a = test_endpoint("UA001");
        let b = test_endpoint("UA002");
        let (recording, mut received) = recording_handler();
        b.register_handler("ANNOUNCE", recording).await.unwrap();
        let (b_on_a, _) = LocalLink::connect(&a, &b).await.unwrap();
        a.register_remote_messages(&b_on_a, ["ANNOUNCE"]).await.unwrap();

        a.signal("ANNOUNCE", json!({"v": 1})).await.unwrap();
        assert_eq!(received.recv().await.unwrap(), json!({"v": 1}));
        assert!(a.pending_transactions().is_empty());
        assert!(b.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_loopback_never_touches_the_wire() {
        let endpoint = test_endpoint("UA001");
        let mut link = MockWireOut::new();
        link.expect_wire_out().never();
        endpoint.add_connection(Connection::new(Arc::new(link))).await.unwrap();
        endpoint.register_handler("SELF_OP", constant_handler(json!("done"))).await.unwrap();
        let mut events = endpoint.subscribe();

        assert_eq!(endpoint.call("SELF_OP", json!({})).await.unwrap(), json!("done"));
        assert!(endpoint.pending_transactions().is_empty());
        assert_eq!(resolved_hops(&mut events), vec![vec![Address::from("UA001")]]);
    }

    #[tokio::test]
    async fn test_responses_are_never_routed() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        let (recording, mut received) = recording_handler();
        endpoint.register_handler("FOREIGN", recording).await.unwrap();

        let foreign = respond(request("UA050", 1, "FOREIGN", json!({}), CallKind::Call), "UA051", json!(1));
        endpoint.receive_packet(&peer, foreign).await.unwrap();

        tokio::task::yield_now().await;
        assert!(received.try_recv().is_err());
        assert!(link.sent_packets().await.is_empty());
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_and_unauthorized() {
        let endpoint = Endpoint::new(EndpointConfig::new()).unwrap();
        endpoint.set_address("UA001".into()).unwrap();
        let peer = endpoint.add_connection(Connection::new(RecordingWireOut::new())).await.unwrap().address;
        let packet = request("UA050", 1, "OP", json!({}), CallKind::Call);

        let e = endpoint.receive_packet(&peer, packet.clone()).await.unwrap_err();
        assert!(matches!(endpoint_error(&e), EndpointError::NotAuthorized(a) if a == &peer));

        let e = endpoint.receive_packet(&"UA999".into(), packet.clone()).await.unwrap_err();
        assert!(matches!(endpoint_error(&e), EndpointError::NotAuthorized(_)));

        endpoint.set_auth_token(&peer, "token").await.unwrap();
        endpoint.receive_packet(&peer, packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_uses_authorizer() {
        let mut authorizer = crate::messaging::connection::MockAuthorizer::new();
        authorizer.expect_authorize()
            .times(1)
            .returning(|connection| connection.auth_token() == Some("letmein"));
        let endpoint = Endpoint::with_authorizer(EndpointConfig::new(), Arc::new(authorizer)).unwrap();
        endpoint.set_address("UA001".into()).unwrap();
        let peer = endpoint.add_connection(Connection::new(RecordingWireOut::new())).await.unwrap().address;
        endpoint.set_auth_token(&peer, "wrong").await.unwrap();

        let e = endpoint.receive_packet(&peer, request("UA050", 1, "OP", json!({}), CallKind::Call)).await.unwrap_err();
        assert!(matches!(endpoint_error(&e), EndpointError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_receive_rejects_local_only() {
        let endpoint = test_endpoint("UA001");
        let (peer, _link) = connect_recording(&endpoint).await;
        let e = endpoint.receive_packet(&peer, request("UA050", 1, "LOCAL:STATE", json!({}), CallKind::Call)).await.unwrap_err();
        assert!(matches!(endpoint_error(&e), EndpointError::LocalOnlyMessage(_)));
    }

    #[tokio::test]
    async fn test_wire_in() {
        let endpoint = test_endpoint("UA001");
        let (peer, link) = connect_recording(&endpoint).await;
        endpoint.register_handler("RAW", constant_handler(json!("ok"))).await.unwrap();

        let mut buf = BytesMut::new();
        request("UA050", 1, "RAW", json!({}), CallKind::Call).ser(&mut buf).unwrap();
        endpoint.wire_in(&peer, &buf).await.unwrap();
        assert_eq!(link.wait_for_packets(1).await[0].payload, json!("ok"));

        assert!(endpoint.wire_in(&peer, b"{garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_send_releases_transaction() {
        let endpoint = test_endpoint("UA001");
        let mut link = MockWireOut::new();
        link.expect_wire_out()
            .returning(|_| Err(anyhow!("connection reset")));
        let remote = endpoint.add_connection(Connection::new(Arc::new(link))).await.unwrap().address;
        endpoint.register_remote_messages(&remote, ["UNREACHABLE"]).await.unwrap();

        let e = endpoint.call("UNREACHABLE", json!({})).await.unwrap_err();
        assert_eq!(format!("{}", e), "connection reset");
        assert!(endpoint.pending_transactions().is_empty());
    }
}
