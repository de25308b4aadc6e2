pub mod local;

#[cfg(test)] use mockall::automock;

use crate::messaging::packet::Packet;

/// This trait decouples the actual transport (WebSocket, Unix domain socket, in-process
///  channels, ...) from the routing logic. Each connection of an endpoint carries its own
///  [WireOut], and the endpoint never assumes anything about it beyond these operations.
///
/// The way back in is [crate::messaging::endpoint::Endpoint::wire_in] (raw bytes) or
///  [crate::messaging::endpoint::Endpoint::receive_packet] (decoded packets): the transport
///  calls one of them with the address of the connection the data arrived on.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait WireOut: Sync + Send + 'static {
    /// serialize and transmit a packet to the peer at the other end of the connection
    async fn wire_out(&self, packet: &Packet) -> anyhow::Result<()>;

    /// called when the endpoint drops the connection, e.g. because it expired
    async fn close(&self);
}
