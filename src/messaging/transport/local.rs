use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messaging::address::Address;
use crate::messaging::connection::Connection;
use crate::messaging::endpoint::Endpoint;
use crate::messaging::packet::Packet;
use crate::messaging::transport::WireOut;

/// credential that [LocalLink::connect] attaches to both ends of an in-process link
pub const LOCAL_LINK_TOKEN: &str = "local-link";

/// An in-process transport: packets are serialized into a tokio channel and decoded at the
///  other end, so endpoints connected this way share nothing but bytes.
pub struct LocalLink {
    sender: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Debug for LocalLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalLink{{open:{}}}", self.is_open())
    }
}

impl LocalLink {
    fn new(sender: mpsc::UnboundedSender<Bytes>) -> LocalLink {
        LocalLink {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Connects two endpoints with each other. Each side registers the other as a connection
    ///  carrying [LOCAL_LINK_TOKEN], and each side's inbound traffic is fed into its
    ///  [Endpoint::wire_in] by a spawned task.
    ///
    /// Returns the address `b` got on `a`, and the address `a` got on `b`.
    pub async fn connect(a: &Arc<Endpoint>, b: &Arc<Endpoint>) -> anyhow::Result<(Address, Address)> {
        let (a_to_b, from_a) = mpsc::unbounded_channel();
        let (b_to_a, from_b) = mpsc::unbounded_channel();

        let b_on_a = a.add_connection(Connection::new(Arc::new(LocalLink::new(a_to_b)))).await?.address;
        let a_on_b = b.add_connection(Connection::new(Arc::new(LocalLink::new(b_to_a)))).await?.address;
        a.set_auth_token(&b_on_a, LOCAL_LINK_TOKEN).await?;
        b.set_auth_token(&a_on_b, LOCAL_LINK_TOKEN).await?;

        spawn_receive_loop(b, a_on_b.clone(), from_a);
        spawn_receive_loop(a, b_on_a.clone(), from_b);

        debug!("linked {:?} and {:?} in-process", a, b);
        Ok((b_on_a, a_on_b))
    }
}

fn spawn_receive_loop(endpoint: &Arc<Endpoint>, from: Address, mut receiver: mpsc::UnboundedReceiver<Bytes>) {
    let endpoint = Arc::downgrade(endpoint);
    tokio::spawn(async move {
        while let Some(raw) = receiver.recv().await {
            let Some(endpoint) = endpoint.upgrade() else {
                break;
            };
            if let Err(e) = endpoint.wire_in(&from, &raw).await {
                warn!("error processing packet from {:?}: {:#}", from, e);
            }
        }
        debug!("local link from {:?} closed", from);
    });
}

#[async_trait::async_trait]
impl WireOut for LocalLink {
    async fn wire_out(&self, packet: &Packet) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf)?;
        trace!("sending {} bytes for {}", buf.len(), packet.id);

        let sender = self.sender.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sender {
            Some(sender) => sender.send(buf.freeze())
                .map_err(|_| anyhow!("peer of local link is gone")),
            None => Err(anyhow!("local link is closed")),
        }
    }

    async fn close(&self) {
        self.sender.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
