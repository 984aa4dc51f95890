use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::metadata;

pub type RequestId = u64;
pub type Payload = serde_json::Value;
pub type Metadata = BTreeMap<String, String>;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What the server should do with an [`InvocationRequest`].
///
/// `Invoke` and `Oneway` reach the subsystem handler. The remaining kinds are
/// runtime control messages handled by the dispatcher itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InvocationKind {
    /// Synchronous call; a correlated response is expected.
    Invoke,
    /// Fire-and-forget call; no response is written.
    Oneway,
    /// Register a callback listener for the subsystem.
    AddListener,
    /// Unregister a callback listener.
    RemoveListener,
    /// Drain the caller's callback store.
    Poll,
    /// Liveness probe; also renews the caller's lease.
    Ping,
    /// Clean client shutdown; terminates the lease without a failure.
    Disconnect,
    /// Turn this connection into the caller's bisocket control channel.
    OpenControl,
    /// Server-to-client callback push (travels on control connections only).
    Callback,
}

impl InvocationKind {
    pub fn expects_response(self) -> bool {
        !matches!(self, InvocationKind::Oneway | InvocationKind::Callback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRequest {
    pub id: RequestId,
    /// Session identifier of the issuing client; keys leases and callback stores.
    pub client_id: String,
    pub subsystem: String,
    pub kind: InvocationKind,
    pub payload: Payload,
    pub metadata: Metadata,
}

impl InvocationRequest {
    pub fn new(subsystem: impl Into<String>, kind: InvocationKind, payload: Payload) -> Self {
        InvocationRequest {
            id: generate_request_id(),
            client_id: String::new(),
            subsystem: subsystem.into(),
            kind,
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn invoke(subsystem: impl Into<String>, payload: Payload) -> Self {
        Self::new(subsystem, InvocationKind::Invoke, payload)
    }

    pub fn oneway(subsystem: impl Into<String>, payload: Payload) -> Self {
        Self::new(subsystem, InvocationKind::Oneway, payload)
    }

    /// A control message with a null payload.
    pub fn control(kind: InvocationKind) -> Self {
        Self::new(String::new(), kind, Payload::Null)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        self.with_meta(metadata::TIMEOUT, timeout_ms)
    }

    /// Per-call timeout override, if the metadata carries a valid one.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata
            .get(metadata::TIMEOUT)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

pub fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // Upper 32 bits from the clock, lower 32 from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}
