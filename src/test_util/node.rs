use std::sync::Arc;

use crate::messaging::address::Address;
use crate::messaging::connection::{AllowAllAuthorizer, Connection};
use crate::messaging::endpoint::Endpoint;
use crate::messaging::endpoint_config::EndpointConfig;
use crate::test_util::wire::RecordingWireOut;

/// convenience for unit test code: an endpoint with the given address and default
///  configuration, admitting every connection
pub fn test_endpoint(address: &str) -> Arc<Endpoint> {
    test_endpoint_with_config(address, EndpointConfig::new())
}

pub fn test_endpoint_with_config(address: &str, config: EndpointConfig) -> Arc<Endpoint> {
    let endpoint = Endpoint::with_authorizer(config, Arc::new(AllowAllAuthorizer))
        .expect("test configuration should be valid");
    endpoint.set_address(address.into())
        .expect("fresh endpoint should accept an address");
    endpoint
}

/// adds a connection with a [RecordingWireOut] to the endpoint, returning its address
pub async fn connect_recording(endpoint: &Endpoint) -> (Address, Arc<RecordingWireOut>) {
    let link = RecordingWireOut::new();
    let added = endpoint.add_connection(Connection::new(link.clone())).await
        .expect("a fresh connection should be accepted");
    (added.address, link)
}
