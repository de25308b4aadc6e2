//! Message routing between endpoints: addressing, connection bookkeeping, local and remote
//!  handler resolution, request / response correlation, and multi-hop forwarding.

pub mod address;
pub mod connection;
pub mod endpoint;
pub mod endpoint_config;
pub mod endpoint_events;
pub mod error;
pub mod handler;
pub mod message_name;
pub mod packet;
pub mod transaction;
pub mod transport;
