use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDRESS_PREFIX: &str = "UA";
pub const DEFAULT_ADDRESS_DIGITS: usize = 3;

/// An [Address] identifies a participant in the message network. Endpoints assign addresses
///  to connections when they join, and a connected endpoint typically adopts the address its
///  peer assigned to it as its own.
///
/// Addresses are opaque strings on the wire; allocated addresses are a prefix followed by a
///  zero-padded counter (e.g. `UA001`) to keep them readable in logs.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Address {
        Address(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

/// Generates addresses that are never reused for the allocator's lifetime. The counter is
///  monotonic and starts at 1.
pub struct AddressAllocator {
    prefix: String,
    digits: usize,
    counter: AtomicU64,
}

impl AddressAllocator {
    pub fn new(prefix: impl Into<String>, digits: usize) -> AddressAllocator {
        AddressAllocator {
            prefix: prefix.into(),
            digits,
            counter: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self) -> Address {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Address(format!("{}{:0width$}", self.prefix, n, width = self.digits))
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        AddressAllocator::new(DEFAULT_ADDRESS_PREFIX, DEFAULT_ADDRESS_DIGITS)
    }
}
