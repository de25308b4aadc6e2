use std::fmt::{Debug, Display, Formatter};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::address::Address;
use crate::messaging::error::EndpointError;
use crate::messaging::message_name::MessageName;

/// Identifies a packet for diagnostics: the address of the endpoint that created it, and that
///  endpoint's packet counter at creation time.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PacketId {
    pub origin: Address,
    pub seq: u64,
}

impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Call,
    Send,
    Signal,
    Ping,
}

impl CallKind {
    /// Signals are the only fire-and-forget kind
    pub fn rsvp(&self) -> bool {
        !matches!(self, CallKind::Signal)
    }
}

/// Correlates a request with its response. Both directions of a packet produce the same key
///  since neither source nor id change when a packet is returned.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransactionKey(String);

impl TransactionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for TransactionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for TransactionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message in flight. Packets are created by an endpoint (which assigns source and id),
///  travel request-wise along a path of endpoints recording each of them in `hops`, and travel
///  back as responses carrying the combined result in `payload`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub message: MessageName,
    pub payload: Value,
    pub source: Address,
    pub hops: Vec<Address>,
    pub direction: Direction,
    pub rsvp: bool,
    pub kind: CallKind,
}

impl Packet {
    pub fn new(id: PacketId, message: MessageName, payload: Value, kind: CallKind) -> Packet {
        Packet {
            source: id.origin.clone(),
            id,
            message,
            payload,
            hops: Vec::new(),
            direction: Direction::Request,
            rsvp: kind.rsvp(),
            kind,
        }
    }

    pub fn transaction_key(&self) -> TransactionKey {
        TransactionKey(format!("{}:{}", self.source, self.id))
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    /// Records `addr` as the most recent hop. An address is never recorded twice in a row, so
    ///  an endpoint relaying a packet it already stamped does not show up twice.
    pub fn add_hop(&mut self, addr: &Address) {
        if self.hops.last() != Some(addr) {
            self.hops.push(addr.clone());
        }
    }

    /// Turns a request into the response travelling back to its source. This happens exactly
    ///  once per packet.
    pub fn set_response(&mut self) -> Result<(), EndpointError> {
        if self.is_response() {
            return Err(EndpointError::AlreadyResponse(self.id.to_string()));
        }
        self.direction = Direction::Response;
        Ok(())
    }

    /// The `error` field of an object payload, if any
    pub fn error(&self) -> Option<&Value> {
        self.payload.as_object()
            .and_then(|o| o.get("error"))
            .filter(|e| !e.is_null())
    }

    /// The payload with a (null) `error` field removed
    pub fn into_result_payload(self) -> Value {
        match self.payload {
            Value::Object(mut o) => {
                o.remove("error");
                Value::Object(o)
            }
            other => other,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut writer = buf.writer();
        serde_json::to_writer(&mut writer, self)?;
        Ok(())
    }

    pub fn try_deser(buf: &[u8]) -> anyhow::Result<Packet> {
        Ok(serde_json::from_slice(buf)?)
    }

    /// Creates a copy of this packet going through a serialization round trip, so that nothing
    ///  is shared with the original. The copy gets the new id and source; message, payload, kind
    ///  and the hop history are preserved.
    pub fn clone_with_id(&self, id: PacketId) -> anyhow::Result<Packet> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        let mut clone = Packet::try_deser(&buf)?;
        clone.source = id.origin.clone();
        clone.id = id;
        Ok(clone)
    }
}
