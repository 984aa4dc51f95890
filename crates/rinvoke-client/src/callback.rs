//! Client side of the callback subsystem.
//!
//! Registered handlers live in a [`ListenerTable`] keyed by a generated
//! listener id. Callbacks reach the table through one of three paths:
//!
//! - the bisocket control connection (see [`crate::invoker::BisocketInvoker`])
//! - a [`CallbackServer`] hosted by this process, dialed by the server
//! - a [`CallbackPoller`] draining the server-side store on a timer

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rinvoke_common::transport::{
    bind, ConnectionContext, ControlChannel, InvocationSink, ServerOptions,
};
use rinvoke_common::{
    Callback, FailureKind, InvocationKind, InvocationRequest, InvocationResponse, Locator, Payload,
    Result,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::invoker::ClientInvoker;

/// Receives callbacks for one listener registration.
pub trait CallbackHandler: Send + Sync {
    fn handle_callback(&self, callback: &Callback);
}

impl<F> CallbackHandler for F
where
    F: Fn(&Callback) + Send + Sync,
{
    fn handle_callback(&self, callback: &Callback) {
        self(callback)
    }
}

struct ListenerEntry {
    id: String,
    subsystem: String,
    handler: Arc<dyn CallbackHandler>,
    handback: Option<Payload>,
}

/// Handlers registered by this client, by listener id.
#[derive(Default)]
pub struct ListenerTable {
    entries: RwLock<Vec<ListenerEntry>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` and returns its new listener id.
    pub fn register(
        &self,
        handler: Arc<dyn CallbackHandler>,
        subsystem: &str,
        handback: Option<Payload>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(ListenerEntry {
                id: id.clone(),
                subsystem: subsystem.to_string(),
                handler,
                handback,
            });
        id
    }

    /// Removes `handler` by identity and returns its listener id.
    pub fn unregister(&self, handler: &Arc<dyn CallbackHandler>) -> Option<String> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let pos = entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.handler, handler))?;
        Some(entries.remove(pos).id)
    }

    pub fn unregister_id(&self, listener_id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.id != listener_id);
        entries.len() != before
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Fills in the handback of the targeted listener.
    ///
    /// A callback without a listener id is addressed to the whole subsystem;
    /// it goes to the first listener of that subsystem.
    pub fn attach_handback(&self, callback: &mut Callback) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let target = entries.iter().find(|entry| Self::targets(entry, callback));
        if let Some(entry) = target {
            callback.handback = entry.handback.clone();
        }
    }

    fn targets(entry: &ListenerEntry, callback: &Callback) -> bool {
        if callback.listener_id.is_empty() {
            entry.subsystem == callback.subsystem
        } else {
            entry.id == callback.listener_id
        }
    }

    /// Hands `callback` to its listener, or to every listener of its
    /// subsystem when it names none. Returns how many handlers ran.
    pub fn deliver(&self, callback: Callback) -> usize {
        let targets: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| Self::targets(entry, &callback))
            .map(|entry| (entry.handler.clone(), entry.handback.clone()))
            .collect();

        if targets.is_empty() {
            tracing::debug!(
                "Dropping callback for unknown listener '{}' of {}",
                callback.listener_id,
                callback.subsystem
            );
            return 0;
        }

        for (handler, handback) in &targets {
            let mut callback = callback.clone();
            callback.handback = handback.clone();
            handler.handle_callback(&callback);
        }
        targets.len()
    }
}

/// Feeds callbacks pushed by a server into a [`ListenerTable`].
struct CallbackSink {
    listeners: Arc<ListenerTable>,
}

#[async_trait]
impl InvocationSink for CallbackSink {
    async fn handle(
        &self,
        request: InvocationRequest,
        ctx: &ConnectionContext,
    ) -> Option<InvocationResponse> {
        match request.kind {
            InvocationKind::Callback => {
                match serde_json::from_value::<Callback>(request.payload) {
                    Ok(callback) => {
                        self.listeners.deliver(callback);
                    }
                    Err(e) => tracing::warn!("Malformed callback from {}: {}", ctx.peer(), e),
                }
                None
            }
            InvocationKind::Ping => Some(InvocationResponse::success(request.id, Payload::Null)),
            InvocationKind::Oneway => None,
            other => Some(InvocationResponse::error(
                request.id,
                FailureKind::InvalidRequest,
                format!("callback server does not accept {:?}", other),
            )),
        }
    }

    fn open_control(&self, _channel: ControlChannel) {}

    fn close_control(&self, _client_id: &str, _connection_id: u64) {}
}

/// In-process server that receives callbacks pushed by the remote side.
///
/// Used when the client is reachable from the server, typically with the
/// HTTP transport where the server cannot push over the client's own
/// connection.
pub struct CallbackServer {
    locator: Locator,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Binds `locator` and starts delivering into `listeners`.
    pub async fn start(
        locator: &Locator,
        listeners: Arc<ListenerTable>,
        options: ServerOptions,
    ) -> Result<Self> {
        let transport = bind(locator, options).await?;
        let bound = transport.locator().clone();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sink: Arc<dyn InvocationSink> = Arc::new(CallbackSink { listeners });

        let task = tokio::spawn(async move {
            if let Err(e) = transport.serve(sink, shutdown_rx).await {
                tracing::warn!("Callback server stopped: {}", e);
            }
        });
        tracing::info!("Callback server listening on {}", bound);

        Ok(Self {
            locator: bound,
            shutdown,
            task,
        })
    }

    /// Where the remote side should deliver callbacks.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Periodically drains the server-side callback store.
pub struct CallbackPoller {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CallbackPoller {
    pub fn spawn(
        invoker: Arc<dyn ClientInvoker>,
        listeners: Arc<ListenerTable>,
        period: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match poll(invoker.as_ref()).await {
                    Ok(callbacks) => {
                        for callback in callbacks {
                            listeners.deliver(callback);
                        }
                    }
                    Err(e) => tracing::debug!("Callback poll against {} failed: {}", invoker.locator(), e),
                }
            }
        });
        Self { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Drains the caller's server-side callback store once.
pub async fn poll(invoker: &dyn ClientInvoker) -> Result<Vec<Callback>> {
    let request = InvocationRequest::control(InvocationKind::Poll);
    let payload = invoker.invoke(request).await?;
    Ok(serde_json::from_value(payload)?)
}
