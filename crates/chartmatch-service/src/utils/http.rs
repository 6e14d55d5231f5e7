use std::time::Duration;

use crate::config::Config;

/// The split timeout budget for one network-bound attempt.
///
/// `connect` bounds the connection-establishment phase, `read` bounds receiving the
/// response. Their sum is the hard ceiling for a single proxy validation or source
/// fetch, so a single hung candidate cannot stall a pool beyond a bounded worst case.
#[derive(Copy, Clone, Debug)]
pub struct ValidationTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response after the connection is up.
    pub read: Duration,
}

impl ValidationTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
        }
    }

    /// The overall per-attempt ceiling.
    pub fn total(&self) -> Duration {
        self.connect + self.read
    }
}

impl Default for ValidationTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(15),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Used for fetching proxy-list sources; validators supplied by collaborators bring
/// their own clients.
pub fn create_client(timeouts: &ValidationTimeouts) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.total())
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}
