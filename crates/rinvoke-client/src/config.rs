use std::time::Duration;

use rinvoke_common::locator::{params, Locator};

pub const DEFAULT_LEASE_PERIOD_MS: u64 = 5000;
pub const DEFAULT_PING_FREQUENCY_MS: u64 = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_CALLBACK_POLL_PERIOD_MS: u64 = 5000;

/// Client heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// `clientLease`
    pub enabled: bool,
    /// `leasePeriod`
    pub period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_millis(DEFAULT_LEASE_PERIOD_MS),
        }
    }
}

impl LeaseConfig {
    pub fn from_locator(locator: &Locator) -> Self {
        Self {
            enabled: locator.flag(params::CLIENT_LEASE),
            period: millis(locator, params::LEASE_PERIOD, DEFAULT_LEASE_PERIOD_MS),
        }
    }
}

/// Bisocket control channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisocketConfig {
    /// `pingFrequency`
    pub ping_frequency: Duration,
    /// `maxRetries`: reconnect attempts before the control channel is declared dead
    pub max_retries: u32,
}

impl Default for BisocketConfig {
    fn default() -> Self {
        Self {
            ping_frequency: Duration::from_millis(DEFAULT_PING_FREQUENCY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BisocketConfig {
    pub fn from_locator(locator: &Locator) -> Self {
        Self {
            ping_frequency: millis(locator, params::PING_FREQUENCY, DEFAULT_PING_FREQUENCY_MS),
            max_retries: locator
                .param_as(params::MAX_RETRIES)
                .unwrap_or(DEFAULT_MAX_RETRIES),
        }
    }
}

/// Pull callback settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackConfig {
    /// `callbackPollPeriod`
    pub poll_period: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_millis(DEFAULT_CALLBACK_POLL_PERIOD_MS),
        }
    }
}

impl CallbackConfig {
    pub fn from_locator(locator: &Locator) -> Self {
        Self {
            poll_period: millis(
                locator,
                params::CALLBACK_POLL_PERIOD,
                DEFAULT_CALLBACK_POLL_PERIOD_MS,
            ),
        }
    }
}

/// A positive millisecond parameter, or `default`.
fn millis(locator: &Locator, key: &str, default: u64) -> Duration {
    Duration::from_millis(
        locator
            .param_as::<u64>(key)
            .filter(|ms| *ms > 0)
            .unwrap_or(default),
    )
}
