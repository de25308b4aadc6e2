use std::time::Duration;

use anyhow::bail;

use crate::messaging::address::{DEFAULT_ADDRESS_DIGITS, DEFAULT_ADDRESS_PREFIX};

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// prefix of addresses allocated for connections
    pub address_prefix: String,
    /// allocated addresses are zero-padded to this many digits
    pub address_digits: usize,

    /// how often connection ages are advanced while aging is enabled
    pub age_interval: Duration,
    /// connections that were not heard from for longer than this are evicted
    pub age_max: Duration,

    /// Upper bound for waiting on a response. `None` waits forever, which is only reasonable
    ///  if the transport reliably reports lost peers.
    pub transaction_timeout: Option<Duration>,

    /// capacity of the event broadcast channel - slow subscribers lag beyond that
    pub event_channel_capacity: usize,
}

impl EndpointConfig {
    pub fn new() -> EndpointConfig {
        EndpointConfig {
            address_prefix: DEFAULT_ADDRESS_PREFIX.to_string(),
            address_digits: DEFAULT_ADDRESS_DIGITS,
            age_interval: Duration::from_secs(1),
            age_max: Duration::from_secs(30 * 60),
            transaction_timeout: Some(Duration::from_secs(30)),
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.age_interval.is_zero() {
            bail!("age interval must be positive");
        }
        if self.age_max < self.age_interval {
            bail!("maximum connection age {:?} is shorter than the aging interval {:?}", self.age_max, self.age_interval);
        }
        if self.transaction_timeout == Some(Duration::ZERO) {
            bail!("transaction timeout must be positive");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig::new()
    }
}
