use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)] use mockall::automock;

use crate::messaging::address::Address;
use crate::messaging::transport::WireOut;

/// The endpoint's handle for a connected peer: the link to send packets through, a credential
///  placeholder, and the time since the peer was last heard from.
pub struct Connection {
    pub(crate) address: Option<Address>,
    pub(crate) auth_token: Option<String>,
    pub(crate) age: Duration,
    pub(crate) link: Arc<dyn WireOut>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{address:{:?}, authenticated:{}, age:{:?}}}", self.address, self.auth_token.is_some(), self.age)
    }
}

impl Connection {
    pub fn new(link: Arc<dyn WireOut>) -> Connection {
        Connection {
            address: None,
            auth_token: None,
            age: Duration::ZERO,
            link,
        }
    }

    /// A handle that already carries an address, e.g. when a peer reconnects with the address
    ///  it was assigned before. Adding it to an endpoint that still tracks that address fails.
    pub fn with_address(link: Arc<dyn WireOut>, address: Address) -> Connection {
        Connection {
            address: Some(address),
            ..Connection::new(link)
        }
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn age(&self) -> Duration {
        self.age
    }
}

/// Decides whether traffic from a connection is admitted. Verification of the credential is
///  entirely up to the implementation.
#[cfg_attr(test, automock)]
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, connection: &Connection) -> bool;
}

/// Admits every connection that carries a token, without looking at the token itself.
pub struct TokenPresentAuthorizer;

impl Authorizer for TokenPresentAuthorizer {
    fn authorize(&self, connection: &Connection) -> bool {
        connection.auth_token.is_some()
    }
}

/// Admits every connection. Useful for in-process setups where there is nothing to verify.
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _connection: &Connection) -> bool {
        true
    }
}
