use std::time::Duration;

use rinvoke_common::locator::{params, Locator};

/// Server worker pool size used when the locator has no `maxPoolSize`.
pub const DEFAULT_MAX_WORKERS: usize = 300;
/// Callbacks kept per client when the locator has no `callbackStoreCapacity`.
pub const DEFAULT_CALLBACK_STORE_CAPACITY: usize = 1000;
/// Lease period assumed for pings that do not announce one.
pub const DEFAULT_LEASE_PERIOD_MS: u64 = 5000;

/// Server-side settings read from the bind locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Maximum concurrently executing handler invocations.
    pub max_workers: usize,
    /// Close socket connections silent for this long.
    pub idle_timeout: Option<Duration>,
    /// Bound of each client's pull callback store.
    pub callback_store_capacity: usize,
    /// Lease period for clients whose pings carry none; also sets the sweep interval.
    pub lease_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            idle_timeout: None,
            callback_store_capacity: DEFAULT_CALLBACK_STORE_CAPACITY,
            lease_period: Duration::from_millis(DEFAULT_LEASE_PERIOD_MS),
        }
    }
}

impl ServerConfig {
    pub fn from_locator(locator: &Locator) -> Self {
        let defaults = Self::default();
        Self {
            max_workers: locator
                .param_as::<usize>(params::MAX_POOL_SIZE)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_workers),
            idle_timeout: locator
                .param_as::<u64>(params::IDLE_TIMEOUT)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            callback_store_capacity: locator
                .param_as::<usize>(params::CALLBACK_STORE_CAPACITY)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.callback_store_capacity),
            lease_period: locator
                .param_as::<u64>(params::LEASE_PERIOD)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease_period),
        }
    }
}
