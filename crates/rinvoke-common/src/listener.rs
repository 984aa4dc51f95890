//! Connection failure notification.
//!
//! Failures detected outside an in-flight call (lease expiry, a dead bisocket
//! control channel, a failed heartbeat) are reported only through
//! [`ConnectionListener`]s, never through a caller's `Result`.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::protocol::RinvokeError;

/// Describes a connection that was declared failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailureEvent {
    /// Client session the connection belonged to.
    pub client_id: String,
    /// Remote endpoint (a locator string or a socket address).
    pub endpoint: String,
    pub reason: String,
}

impl ConnectionFailureEvent {
    pub fn new(
        client_id: impl Into<String>,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConnectionFailureEvent {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn to_error(&self) -> RinvokeError {
        RinvokeError::ConnectionFailure(format!("{} ({})", self.reason, self.endpoint))
    }
}

impl fmt::Display for ConnectionFailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client {} at {} failed: {}",
            self.client_id, self.endpoint, self.reason
        )
    }
}

pub trait ConnectionListener: Send + Sync {
    fn handle_connection_failure(&self, event: &ConnectionFailureEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionFailureEvent) + Send + Sync,
{
    fn handle_connection_failure(&self, event: &ConnectionFailureEvent) {
        self(event)
    }
}

/// A set of listeners notified in registration order.
#[derive(Default, Clone)]
pub struct ConnectionListeners {
    listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
}

impl ConnectionListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Removes a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &ConnectionFailureEvent) {
        tracing::warn!("Connection failure: {}", event);
        // Snapshot so a listener may register or remove listeners re-entrantly
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.handle_connection_failure(event);
        }
    }
}
