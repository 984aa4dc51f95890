//! The server connector.
//!
//! A [`Connector`] binds one locator, owns the handler registry, and wires the
//! transport listener to the dispatcher, the callback manager and the lease
//! sweeper.
//!
//! # Lifecycle
//!
//! ```text
//! new -> create -> start <-> stop -> destroy
//! ```
//!
//! `start` creates the connector first if needed. `stop` closes the listening
//! socket but keeps handlers, leases and stored callbacks, so a later `start`
//! rebinds the same address. After `destroy` every call that needs the bound
//! connector fails with `InvalidState`.

use std::sync::Arc;

use rinvoke_common::marshal::MarshallerRegistry;
use rinvoke_common::transport::{bind, DialOptions, InvocationSink, ServerOptions, ServerTransport, TlsContext};
use rinvoke_common::{
    Callback, ConnectionListener, ConnectionListeners, Locator, Payload, Result, RinvokeError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::callback::{CallbackManager, PublishReport};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::lease::LeaseTracker;
use crate::registry::{HandlerRegistry, InvocationHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Initial,
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Everything that exists once the connector is created.
struct Bound {
    /// Bind locator with the real port; rebinding after `stop` reuses it.
    locator: Locator,
    /// Present while listening.
    transport: Option<Arc<dyn ServerTransport>>,
    dispatcher: Dispatcher,
    callbacks: Arc<CallbackManager>,
    leases: Arc<LeaseTracker>,
}

pub struct Connector {
    locator: Locator,
    config: ServerConfig,
    tls: Option<TlsContext>,
    marshallers: MarshallerRegistry,
    handlers: Arc<HandlerRegistry>,
    listeners: ConnectionListeners,
    state: ConnectorState,
    bound: Option<Bound>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connector {
    pub fn new(locator: Locator) -> Self {
        let config = ServerConfig::from_locator(&locator);
        Self {
            locator,
            config,
            tls: None,
            marshallers: MarshallerRegistry::default(),
            handlers: Arc::new(HandlerRegistry::new()),
            listeners: ConnectionListeners::new(),
            state: ConnectorState::Initial,
            bound: None,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Parses `locator` and builds a connector for it.
    pub fn parse(locator: &str) -> Result<Self> {
        Ok(Self::new(Locator::parse(locator)?))
    }

    /// TLS context for `sslsocket`, `sslbisocket` and `https` listeners, also
    /// used when dialing TLS reverse callback servers.
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_marshallers(mut self, marshallers: MarshallerRegistry) -> Self {
        self.marshallers = marshallers;
        self
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == ConnectorState::Started
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bound locator once created (port 0 resolved), the configured one before.
    pub fn locator(&self) -> &Locator {
        match &self.bound {
            Some(bound) => &bound.locator,
            None => &self.locator,
        }
    }

    /// Binds the listening socket.
    pub async fn create(&mut self) -> Result<()> {
        match self.state {
            ConnectorState::Initial => {}
            ConnectorState::Destroyed => return Err(destroyed()),
            _ => return Ok(()),
        }

        let transport = self.bind(&self.locator).await?;

        let dial_options = DialOptions {
            tls: self.tls.clone(),
            marshallers: self.marshallers.clone(),
        };
        let callbacks = Arc::new(CallbackManager::new(
            self.config.callback_store_capacity,
            dial_options,
            self.listeners.clone(),
        ));
        let leases = Arc::new(LeaseTracker::new(self.listeners.clone()));
        let dispatcher = Dispatcher::new(
            self.handlers.clone(),
            callbacks.clone(),
            leases.clone(),
            self.config.max_workers,
            self.config.lease_period,
        );

        tracing::info!("Connector created on {}", transport.locator());
        self.bound = Some(Bound {
            locator: transport.locator().clone(),
            transport: Some(transport),
            dispatcher,
            callbacks,
            leases,
        });
        self.state = ConnectorState::Created;
        Ok(())
    }

    /// Starts accepting connections and sweeping leases.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            ConnectorState::Initial => self.create().await?,
            ConnectorState::Started => return Ok(()),
            ConnectorState::Destroyed => return Err(destroyed()),
            ConnectorState::Created | ConnectorState::Stopped => {}
        }
        let transport = match self.bound()?.transport.clone() {
            Some(transport) => transport,
            None => {
                let locator = self.bound()?.locator.clone();
                let transport = self.bind(&locator).await?;
                if let Some(bound) = self.bound.as_mut() {
                    bound.transport = Some(transport.clone());
                }
                transport
            }
        };
        let bound = self.bound()?;
        let dispatcher = bound.dispatcher.clone();
        let leases = bound.leases.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink: Arc<dyn InvocationSink> = Arc::new(dispatcher.clone());
        let serve_shutdown = shutdown_rx.clone();
        let serve = tokio::spawn(async move {
            if let Err(e) = transport.serve(sink, serve_shutdown).await {
                tracing::error!("Connector listener failed: {}", e);
            }
        });

        let sweep = leases.spawn(self.config.lease_period / 2, shutdown_rx, move |client_id| {
            let dispatcher = dispatcher.clone();
            let client_id = client_id.to_string();
            tokio::spawn(async move { dispatcher.expire_client(&client_id).await });
        });

        self.tasks = vec![serve, sweep];
        self.shutdown = Some(shutdown_tx);
        self.state = ConnectorState::Started;
        tracing::info!("Connector started on {}", self.locator());
        Ok(())
    }

    /// Stops accepting connections. In-flight connections are closed.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            ConnectorState::Started => {}
            ConnectorState::Destroyed => return Err(destroyed()),
            _ => return Ok(()),
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Connector task ended abnormally: {}", e);
            }
        }
        if let Some(bound) = self.bound.as_mut() {
            bound.transport = None;
        }
        self.state = ConnectorState::Stopped;
        tracing::info!("Connector on {} stopped", self.locator());
        Ok(())
    }

    /// Stops the connector if needed and releases the listening socket.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state == ConnectorState::Destroyed {
            return Ok(());
        }
        self.stop().await?;
        self.bound = None;
        self.state = ConnectorState::Destroyed;
        tracing::info!("Connector on {} destroyed", self.locator);
        Ok(())
    }

    async fn bind(&self, locator: &Locator) -> Result<Arc<dyn ServerTransport>> {
        let options = ServerOptions {
            tls: self.tls.clone(),
            marshallers: self.marshallers.clone(),
            idle_timeout: self.config.idle_timeout,
        };
        Ok(Arc::from(bind(locator, options).await?))
    }

    fn bound(&self) -> Result<&Bound> {
        match (&self.bound, self.state) {
            (_, ConnectorState::Destroyed) => Err(destroyed()),
            (Some(bound), _) => Ok(bound),
            (None, _) => Err(RinvokeError::InvalidState(
                "connector has not been created".to_string(),
            )),
        }
    }

    /// Registers `handler` for `subsystem`, replacing and returning any earlier one.
    pub fn add_invocation_handler(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn InvocationHandler>,
    ) -> Option<Arc<dyn InvocationHandler>> {
        let subsystem = subsystem.into();
        tracing::debug!("Handler registered for {}", subsystem);
        self.handlers.add(subsystem, handler)
    }

    pub fn remove_invocation_handler(&self, subsystem: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers.remove(subsystem)
    }

    pub fn subsystems(&self) -> Vec<String> {
        self.handlers.names()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Fans `payload` out to every listener registered for `subsystem`.
    pub async fn publish(&self, subsystem: &str, payload: Payload) -> Result<PublishReport> {
        Ok(self.bound()?.callbacks.publish(subsystem, payload).await)
    }

    /// Queues a callback for `client_id` to collect on its next poll.
    pub fn enqueue_callback(&self, client_id: &str, subsystem: &str, payload: Payload) -> Result<()> {
        self.bound()?
            .callbacks
            .enqueue(client_id, Callback::new("", subsystem, payload));
        Ok(())
    }

    /// Callbacks waiting in the pull store of `client_id`.
    pub fn pending_callbacks(&self, client_id: &str) -> usize {
        self.bound
            .as_ref()
            .map_or(0, |bound| bound.callbacks.pending(client_id))
    }

    pub fn has_lease(&self, client_id: &str) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| bound.leases.contains(client_id))
    }

    pub fn has_control_channel(&self, client_id: &str) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| bound.callbacks.has_control(client_id))
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

fn destroyed() -> RinvokeError {
    RinvokeError::InvalidState("connector has been destroyed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Invocation;
    use async_trait::async_trait;
    use rinvoke_common::transport::dialer_for;
    use rinvoke_common::InvocationRequest;
    use serde_json::json;

    struct Bar;

    #[async_trait]
    impl InvocationHandler for Bar {
        async fn invoke(&self, _invocation: Invocation) -> Result<Payload> {
            Ok(json!("bar"))
        }
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let mut connector = Connector::parse("socket://127.0.0.1:0").unwrap();
        assert_eq!(connector.state(), ConnectorState::Initial);
        assert!(connector.publish("x", json!(1)).await.is_err());

        connector.create().await.unwrap();
        assert_ne!(connector.locator().port(), 0);
        connector.start().await.unwrap();
        assert!(connector.is_started());
        let bound = connector.locator().clone();
        connector.stop().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Stopped);
        connector.start().await.unwrap();
        assert_eq!(connector.locator(), &bound);
        connector.destroy().await.unwrap();

        assert!(matches!(connector.start().await, Err(RinvokeError::InvalidState(_))));
        assert!(matches!(
            connector.enqueue_callback("c", "s", json!(1)),
            Err(RinvokeError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_serves_registered_handler() {
        let mut connector = Connector::parse("socket://127.0.0.1:0").unwrap();
        connector.add_invocation_handler("test", Arc::new(Bar));
        connector.start().await.unwrap();

        let locator = connector.locator().clone();
        let dialer = dialer_for(&locator, DialOptions::default()).unwrap();
        let mut channel = dialer.dial(&locator).await.unwrap();
        let response = channel
            .exchange(&InvocationRequest::invoke("test", json!("foo")))
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!("bar"));

        assert!(connector.remove_invocation_handler("test").is_some());
        let response = channel
            .exchange(&InvocationRequest::invoke("test", json!("foo")))
            .await
            .unwrap();
        assert!(matches!(response.into_result(), Err(RinvokeError::NoSuchHandler(_))));
    }

    #[tokio::test]
    async fn test_enqueued_callbacks_wait_for_poll() {
        let mut connector = Connector::parse("socket://127.0.0.1:0").unwrap();
        connector.create().await.unwrap();
        connector.enqueue_callback("client-x", "events", json!("event-1")).unwrap();
        assert_eq!(connector.pending_callbacks("client-x"), 1);
        assert_eq!(connector.pending_callbacks("client-y"), 0);
    }
}
