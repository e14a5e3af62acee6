//! Per-channel consumer configuration.

use processor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings a channel consumer is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Deliveries beyond this attempt count are discarded by the transport.
    pub max_attempts: u32,
    /// A delivery not resolved within this deadline is redelivered.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Ceiling on concurrently outstanding deliveries for the channel.
    pub max_in_flight: usize,
}

impl ChannelConfig {
    pub fn new(max_attempts: u32, timeout: Duration, max_in_flight: usize) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::config("max_attempts must be positive"));
        }
        if timeout.is_zero() {
            return Err(Error::config("timeout must be positive"));
        }
        if max_in_flight == 0 {
            return Err(Error::config("max_in_flight must be positive"));
        }

        Ok(Self {
            max_attempts,
            timeout,
            max_in_flight,
        })
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
