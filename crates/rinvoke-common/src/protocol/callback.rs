use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::requests::Payload;

/// An asynchronous notification addressed to one client-side listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Callback {
    /// Registration the callback targets, as assigned by the client.
    pub listener_id: String,
    pub subsystem: String,
    pub payload: Payload,
    /// Opaque value supplied at registration; filled in on the client.
    pub handback: Option<Payload>,
    pub timestamp_ms: u64,
}

impl Callback {
    pub fn new(listener_id: impl Into<String>, subsystem: impl Into<String>, payload: Payload) -> Self {
        Callback {
            listener_id: listener_id.into(),
            subsystem: subsystem.into(),
            payload,
            handback: None,
            timestamp_ms: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
