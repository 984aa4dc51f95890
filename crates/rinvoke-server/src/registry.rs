use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rinvoke_common::{InvocationRequest, Metadata, Payload, Result};

use crate::callback::{CallbackManager, ListenerRegistration, PublishReport};

/// Publishes callbacks for one subsystem on behalf of its handler.
#[derive(Clone)]
pub struct CallbackPublisher {
    subsystem: String,
    callbacks: Arc<CallbackManager>,
}

impl CallbackPublisher {
    pub(crate) fn new(subsystem: impl Into<String>, callbacks: Arc<CallbackManager>) -> Self {
        Self {
            subsystem: subsystem.into(),
            callbacks,
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Sends `payload` to every listener registered for this subsystem.
    pub async fn publish(&self, payload: Payload) -> PublishReport {
        self.callbacks.publish(&self.subsystem, payload).await
    }
}

/// One invocation as a handler sees it.
pub struct Invocation {
    pub request: InvocationRequest,
    pub callbacks: CallbackPublisher,
}

impl Invocation {
    pub fn payload(&self) -> &Payload {
        &self.request.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.request.metadata
    }

    pub fn client_id(&self) -> &str {
        &self.request.client_id
    }
}

/// Application code serving one subsystem.
///
/// Returning `Err` sends a `HandlerFailure` (or the error's own remote kind)
/// back to the caller; the connection stays usable.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<Payload>;

    /// Called after a listener for this subsystem was registered.
    async fn add_listener(&self, _registration: &ListenerRegistration) -> Result<()> {
        Ok(())
    }

    /// Called after a listener for this subsystem was removed.
    async fn remove_listener(&self, _registration: &ListenerRegistration) -> Result<()> {
        Ok(())
    }
}

/// Subsystem name to handler map. Mutable while the server runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn InvocationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `subsystem`, returning the handler it replaced.
    pub fn add(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn InvocationHandler>,
    ) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subsystem.into(), handler)
    }

    pub fn remove(&self, subsystem: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subsystem)
    }

    pub fn get(&self, subsystem: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(subsystem)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
