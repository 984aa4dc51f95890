//! Request routing.
//!
//! The dispatcher is the [`InvocationSink`] every server transport feeds.
//! Invocations run on a bounded worker pool; oneway invocations are queued
//! on their connection and run in arrival order while the read loop moves
//! on. Control kinds (listeners, polling, pings, disconnects) are answered
//! here without reaching a handler.
//!
//! Handlers are not cancelled when a client gives up waiting. A client-side
//! timeout only abandons the wait; the handler runs to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rinvoke_common::protocol::metadata;
use rinvoke_common::transport::{ConnectionCloser, ConnectionContext, ControlChannel, InvocationSink};
use rinvoke_common::{
    InvocationKind, InvocationRequest, InvocationResponse, Payload, RemoteFailure,
    Result, RinvokeError,
};
use tokio::sync::Semaphore;

use crate::callback::CallbackManager;
use crate::lease::LeaseTracker;
use crate::registry::{CallbackPublisher, HandlerRegistry, Invocation};

#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackManager>,
    leases: Arc<LeaseTracker>,
    workers: Arc<Semaphore>,
    lease_period: Duration,
    /// Live server connections each client has sent requests on.
    connections: Arc<Mutex<HashMap<String, Vec<(u64, ConnectionCloser)>>>>,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackManager>,
        leases: Arc<LeaseTracker>,
        max_workers: usize,
        lease_period: Duration,
    ) -> Self {
        Self {
            handlers,
            callbacks,
            leases,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            lease_period,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Workers currently free to run a handler.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Runs the handler registered for `request.subsystem` on the worker pool.
    pub async fn dispatch(&self, request: InvocationRequest) -> Result<Payload> {
        let handler = self
            .handlers
            .get(&request.subsystem)
            .ok_or_else(|| RinvokeError::NoSuchHandler(request.subsystem.clone()))?;

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RinvokeError::InvalidState("worker pool closed".to_string()))?;

        let invocation = Invocation {
            callbacks: CallbackPublisher::new(&request.subsystem, self.callbacks.clone()),
            request,
        };

        let task = tokio::spawn(async move {
            let _permit = permit;
            handler.invoke(invocation).await
        });

        match task.await {
            Ok(result) => result.map_err(into_handler_error),
            Err(e) if e.is_panic() => Err(RinvokeError::HandlerFailure(
                "handler panicked".to_string(),
            )),
            Err(e) => Err(RinvokeError::HandlerFailure(e.to_string())),
        }
    }

    async fn add_listener(&self, request: &InvocationRequest) -> Result<Payload> {
        let (client_id, listener_id) = listener_ids(request)?;
        let handler = self
            .handlers
            .get(&request.subsystem)
            .ok_or_else(|| RinvokeError::NoSuchHandler(request.subsystem.clone()))?;

        let registration = self.callbacks.add_listener(
            client_id,
            listener_id,
            &request.subsystem,
            request.metadata.clone(),
        )?;
        if let Err(e) = handler.add_listener(&registration).await {
            self.callbacks.remove_listener(client_id, listener_id);
            return Err(into_handler_error(e));
        }
        Ok(Payload::Null)
    }

    async fn remove_listener(&self, request: &InvocationRequest) -> Result<Payload> {
        let (client_id, listener_id) = listener_ids(request)?;
        let registration = self
            .callbacks
            .remove_listener(client_id, listener_id)
            .ok_or_else(|| {
                RinvokeError::InvalidRequest(format!("listener {} is not registered", listener_id))
            })?;

        if let Some(handler) = self.handlers.get(&registration.subsystem) {
            handler
                .remove_listener(&registration)
                .await
                .map_err(into_handler_error)?;
        }
        Ok(Payload::Null)
    }

    fn poll(&self, request: &InvocationRequest) -> Result<Payload> {
        let client_id = require_client_id(request)?;
        Ok(serde_json::to_value(self.callbacks.poll(client_id))?)
    }

    fn ping(&self, request: &InvocationRequest, ctx: &ConnectionContext) {
        if request.client_id.is_empty() {
            return;
        }
        let announced = request
            .meta(metadata::LEASE_PERIOD)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        match announced {
            Some(period) => self.leases.renew(&request.client_id, period, ctx.peer()),
            None if self.leases.contains(&request.client_id) => {
                self.leases
                    .renew(&request.client_id, self.lease_period, ctx.peer())
            }
            None => {}
        }
    }

    fn track(&self, client_id: &str, ctx: &ConnectionContext) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if !connections.contains_key(client_id) {
            connections.retain(|_, conns| {
                conns.retain(|(_, closer)| !closer.is_finished());
                !conns.is_empty()
            });
        }
        let conns = connections.entry(client_id.to_string()).or_default();
        if !conns.iter().any(|(id, _)| *id == ctx.id()) {
            conns.retain(|(_, closer)| !closer.is_finished());
            conns.push((ctx.id(), ctx.closer()));
        }
    }

    /// Number of open connections `client_id` has used.
    pub fn connection_count(&self, client_id: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .map_or(0, |conns| conns.iter().filter(|(_, c)| !c.is_finished()).count())
    }

    /// Handles a lapsed lease: closes every connection the client used, then
    /// forgets it like [`drop_client`](Self::drop_client).
    pub async fn expire_client(&self, client_id: &str) {
        let conns = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id)
            .unwrap_or_default();
        for (_, closer) in &conns {
            closer.close();
        }
        if !conns.is_empty() {
            tracing::debug!("Closed {} connections of expired client {}", conns.len(), client_id);
        }
        self.drop_client(client_id).await;
    }

    /// Forgets a client: its lease, listeners, stored callbacks and control channel.
    pub async fn drop_client(&self, client_id: &str) {
        self.leases.terminate(client_id);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        for registration in self.callbacks.drop_client(client_id) {
            if let Some(handler) = self.handlers.get(&registration.subsystem) {
                if let Err(e) = handler.remove_listener(&registration).await {
                    tracing::debug!(
                        "Handler for {} failed to remove listener {}: {}",
                        registration.subsystem,
                        registration.listener_id,
                        e
                    );
                }
            }
        }
    }

    async fn route(&self, request: &InvocationRequest, ctx: &ConnectionContext) -> Result<Payload> {
        match request.kind {
            InvocationKind::AddListener => self.add_listener(request).await,
            InvocationKind::RemoveListener => self.remove_listener(request).await,
            InvocationKind::Poll => self.poll(request),
            InvocationKind::Ping => {
                self.ping(request, ctx);
                Ok(Payload::Null)
            }
            InvocationKind::Disconnect => {
                let client_id = require_client_id(request)?;
                tracing::debug!("Client {} disconnected from {}", client_id, ctx.peer());
                self.drop_client(client_id).await;
                Ok(Payload::Null)
            }
            InvocationKind::OpenControl => Err(RinvokeError::InvalidRequest(
                "control channels require a bisocket transport".to_string(),
            )),
            other => Err(RinvokeError::InvalidRequest(format!(
                "{:?} is not a control invocation",
                other
            ))),
        }
    }
}

#[async_trait]
impl InvocationSink for Dispatcher {
    async fn handle(
        &self,
        request: InvocationRequest,
        ctx: &ConnectionContext,
    ) -> Option<InvocationResponse> {
        let id = request.id;
        if !request.client_id.is_empty() && request.kind != InvocationKind::Disconnect {
            self.track(&request.client_id, ctx);
        }
        match request.kind {
            InvocationKind::Invoke => Some(respond(id, self.dispatch(request).await)),
            InvocationKind::Oneway => {
                let dispatcher = self.clone();
                let subsystem = request.subsystem.clone();
                let job = async move {
                    if let Err(e) = dispatcher.dispatch(request).await {
                        tracing::warn!("Oneway invocation of {} failed: {}", subsystem, e);
                    }
                };
                ctx.enqueue_oneway(job.boxed());
                None
            }
            InvocationKind::Callback => {
                tracing::warn!("Ignoring callback push from {}", ctx.peer());
                None
            }
            _ => Some(respond(id, self.route(&request, ctx).await)),
        }
    }

    fn open_control(&self, channel: ControlChannel) {
        tracing::debug!(
            "Control channel opened for client {} on connection {}",
            channel.client_id(),
            channel.connection_id()
        );
        self.callbacks.open_control(channel);
    }

    fn close_control(&self, client_id: &str, connection_id: u64) {
        tracing::debug!(
            "Control channel of client {} on connection {} closed",
            client_id,
            connection_id
        );
        self.callbacks.close_control(client_id, connection_id);
    }
}

fn respond(id: u64, result: Result<Payload>) -> InvocationResponse {
    match result {
        Ok(value) => InvocationResponse::success(id, value),
        Err(e) => InvocationResponse::failure(id, RemoteFailure::from(&e)),
    }
}

/// Keeps the error kinds a caller can act on; everything else a handler
/// raises reaches the client as a handler failure.
fn into_handler_error(err: RinvokeError) -> RinvokeError {
    match err {
        RinvokeError::NoSuchHandler(_)
        | RinvokeError::HandlerFailure(_)
        | RinvokeError::Marshalling(_)
        | RinvokeError::InvalidRequest(_) => err,
        other => RinvokeError::HandlerFailure(other.to_string()),
    }
}

fn require_client_id(request: &InvocationRequest) -> Result<&str> {
    if request.client_id.is_empty() {
        return Err(RinvokeError::InvalidRequest(format!(
            "{:?} requires a client id",
            request.kind
        )));
    }
    Ok(&request.client_id)
}

fn listener_ids(request: &InvocationRequest) -> Result<(&str, &str)> {
    let client_id = require_client_id(request)?;
    let listener_id = request.meta(metadata::LISTENER_ID).ok_or_else(|| {
        RinvokeError::InvalidRequest(format!("{:?} requires {}", request.kind, metadata::LISTENER_ID))
    })?;
    Ok((client_id, listener_id))
}
