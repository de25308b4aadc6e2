use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::messaging::error::EndpointError;

/// Messages with this prefix are handled purely within a process and never cross the wire.
pub const LOCAL_MESSAGE_PREFIX: &str = "LOCAL:";

/// Reserved local message delivered to local handlers when a connection is evicted.
pub const DISCONNECTED_MESSAGE: &str = "LOCAL:DISCONNECTED";

/// The name of an operation in the message network. Names are validated on construction: they
///  must be non-empty and uppercase, so that registrations made with different casing can not
///  silently end up in different table entries.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageName(String);

impl MessageName {
    pub fn new(name: impl Into<String>) -> Result<MessageName, EndpointError> {
        let name = name.into();
        if name.is_empty() || name != name.to_uppercase() {
            return Err(EndpointError::InvalidMessageName(name));
        }
        Ok(MessageName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Local-only messages must stay in-process: network sends are refused for them, and they
    ///  are never registered in the forward table.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_PREFIX)
    }
}

impl TryFrom<String> for MessageName {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MessageName::new(value)
    }
}

impl TryFrom<&str> for MessageName {
    type Error = EndpointError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MessageName::new(value)
    }
}

impl From<MessageName> for String {
    fn from(value: MessageName) -> Self {
        value.0
    }
}

impl AsRef<str> for MessageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Debug for MessageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Display for MessageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
