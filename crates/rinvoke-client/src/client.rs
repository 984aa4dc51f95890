use std::sync::Arc;
use std::time::Duration;

use rinvoke_common::protocol::metadata;
use rinvoke_common::transport::{DialOptions, ServerOptions, TlsContext};
use rinvoke_common::{
    Callback, ConnectionListener, ConnectionListeners, InvocationKind, InvocationRequest, Locator,
    Metadata, Payload, Result, RinvokeError,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::callback::{self, CallbackHandler, CallbackPoller, CallbackServer, ListenerTable};
use crate::config::{CallbackConfig, LeaseConfig};
use crate::invoker::{invoker_for, ClientInvoker, InvokerState};
use crate::lease::LeasePinger;
use crate::pool::{ConnectionPool, PoolConfig};

/// How callbacks for this client's listeners reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Pushed over the bisocket control connection.
    Control,
    /// Pushed by the server to a [`CallbackServer`] hosted by this client.
    Reverse,
    /// Drained from the server-side store by a [`CallbackPoller`].
    Pull,
}

/// State that exists only while connected.
struct Session {
    invoker: Arc<dyn ClientInvoker>,
    pinger: Option<LeasePinger>,
    poller: Option<CallbackPoller>,
    callback_server: Option<CallbackServer>,
    reaper: Option<JoinHandle<()>>,
}

impl Session {
    async fn stop_background(&mut self) {
        if let Some(pinger) = self.pinger.take() {
            pinger.stop().await;
        }
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        if let Some(server) = self.callback_server.take() {
            server.stop().await;
        }
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Remote invocation client bound to one subsystem.
///
/// Calls go through a shared [`ConnectionPool`]; `connect` picks the first
/// reachable home of the locator (the primary address, then each
/// `connectHomes` entry) and keeps that binding until `disconnect`.
///
/// # Example
///
/// ```no_run
/// use rinvoke_client::Client;
/// use rinvoke_common::Metadata;
/// use serde_json::json;
///
/// # async fn run() -> rinvoke_common::Result<()> {
/// let client = Client::parse("socket://localhost:5400", "test")?;
/// client.connect().await?;
/// let reply = client.invoke(json!("foo"), Metadata::new()).await?;
/// assert_eq!(reply, json!("bar"));
/// client.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    locator: Locator,
    subsystem: String,
    client_id: String,
    pool: Arc<ConnectionPool>,
    listeners: ConnectionListeners,
    callbacks: Arc<ListenerTable>,
    callback_locator: Option<Locator>,
    callback_options: ServerOptions,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Client {
    pub fn new(locator: Locator, subsystem: impl Into<String>) -> Self {
        Self {
            locator,
            subsystem: subsystem.into(),
            client_id: Uuid::new_v4().to_string(),
            pool: Arc::new(ConnectionPool::default()),
            listeners: ConnectionListeners::new(),
            callbacks: Arc::new(ListenerTable::new()),
            callback_locator: None,
            callback_options: ServerOptions::default(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn parse(locator: &str, subsystem: impl Into<String>) -> Result<Self> {
        Ok(Self::new(locator.parse()?, subsystem))
    }

    /// Uses `tls` for TLS transports. Replaces the client's own pool, so call
    /// it before `with_pool` when sharing a pool.
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.pool = Arc::new(ConnectionPool::new(DialOptions::default().with_tls(tls.clone())));
        self.callback_options.tls = Some(tls);
        self
    }

    /// Shares `pool` with other clients.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Hosts a callback server on `locator` and asks the server to push
    /// callbacks there instead of storing them for polling.
    pub fn with_callback_locator(mut self, locator: Locator) -> Self {
        self.callback_locator = Some(locator);
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Session id sent with every request; keys the server-side lease and
    /// callback store.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn state(&self) -> InvokerState {
        match self.session.lock().await.as_ref() {
            Some(session) => session.invoker.state(),
            None => InvokerState::Unconnected,
        }
    }

    /// The home this client is bound to, once connected.
    pub async fn connected_locator(&self) -> Option<Locator> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.invoker.locator().clone())
    }

    pub fn callback_mode(&self) -> CallbackMode {
        if self.locator.transport().is_bisocket() {
            CallbackMode::Control
        } else if self.callback_locator.is_some() {
            CallbackMode::Reverse
        } else {
            CallbackMode::Pull
        }
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Connects to the first reachable home.
    ///
    /// Calling it while connected is a no-op. A failed binding is torn down
    /// and replaced.
    ///
    /// # Errors
    ///
    /// - `MalformedLocator` if `connectHomes` is malformed
    /// - `CannotConnect` if no home accepts a connection
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if existing.invoker.state() == InvokerState::Connected {
                return Ok(());
            }
        }
        if let Some(mut stale) = session.take() {
            stale.stop_background().await;
            stale.invoker.disconnect().await;
        }

        let homes = self.locator.homes()?;
        let single = homes.len() == 1;
        let mut failures = Vec::new();

        for home in homes {
            let invoker = invoker_for(
                &home,
                &self.client_id,
                self.pool.clone(),
                self.listeners.clone(),
                self.callbacks.clone(),
            );
            match invoker.connect().await {
                Ok(()) => {
                    tracing::info!("Client {} connected to {}", self.client_id, home);
                    *session = Some(self.open_session(&home, invoker));
                    return Ok(());
                }
                Err(e) if single => return Err(e),
                Err(e) => {
                    tracing::debug!("Home {} unreachable: {}", home, e);
                    failures.push(format!("{}: {}", home.address(), e));
                }
            }
        }

        Err(RinvokeError::CannotConnect {
            locator: self.locator.to_string(),
            reason: format!("no home reachable ({})", failures.join("; ")),
        })
    }

    fn open_session(&self, home: &Locator, invoker: Arc<dyn ClientInvoker>) -> Session {
        let lease = LeaseConfig::from_locator(home);
        let pinger = lease.enabled.then(|| {
            LeasePinger::spawn(
                invoker.clone(),
                lease,
                self.client_id.clone(),
                self.listeners.clone(),
            )
        });
        let reaper = PoolConfig::from_locator(home)
            .idle_timeout
            .map(|idle| self.pool.spawn_reaper((idle / 2).max(Duration::from_millis(10))));

        Session {
            invoker,
            pinger,
            poller: None,
            callback_server: None,
            reaper,
        }
    }

    /// Removes listeners, ends the server-side session and releases pooled
    /// connections. Disconnecting twice is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let invoker = session.invoker.clone();
        if let Some(pinger) = session.pinger.take() {
            pinger.stop().await;
        }

        if invoker.state() == InvokerState::Connected {
            for listener_id in self.callbacks.ids() {
                let request = self.listener_request(InvocationKind::RemoveListener, &listener_id);
                if let Err(e) = invoker.invoke(request).await {
                    tracing::debug!("Failed to remove listener {}: {}", listener_id, e);
                }
            }
            let bye = InvocationRequest::control(InvocationKind::Disconnect);
            if let Err(e) = invoker.invoke(bye).await {
                tracing::debug!("Disconnect notice to {} failed: {}", invoker.locator(), e);
            }
        }
        self.callbacks.clear();

        session.stop_background().await;
        invoker.disconnect().await;
        tracing::info!("Client {} disconnected from {}", self.client_id, invoker.locator());
        Ok(())
    }

    async fn invoker(&self) -> Result<Arc<dyn ClientInvoker>> {
        match self.session.lock().await.as_ref() {
            Some(session) => Ok(session.invoker.clone()),
            None => Err(RinvokeError::InvalidState(format!(
                "client for {} is not connected",
                self.locator
            ))),
        }
    }

    /// Invokes the subsystem handler with `payload` and waits for its result.
    ///
    /// `metadata` may carry a `timeout` overriding the locator's.
    pub async fn invoke(&self, payload: Payload, metadata: Metadata) -> Result<Payload> {
        let invoker = self.invoker().await?;
        let request = InvocationRequest::invoke(&self.subsystem, payload).with_metadata(metadata);
        invoker.invoke(request).await
    }

    /// Sends a oneway invocation.
    ///
    /// Synchronous oneways sent one after another reach the handler in the
    /// order they were sent. With `is_async` the send runs on its own task and
    /// this returns immediately; ordering between async oneways is not kept
    /// and send failures are only logged.
    pub async fn invoke_oneway(
        &self,
        payload: Payload,
        metadata: Metadata,
        is_async: bool,
    ) -> Result<()> {
        let invoker = self.invoker().await?;
        let request = InvocationRequest::oneway(&self.subsystem, payload).with_metadata(metadata);
        if !is_async {
            return invoker.invoke_oneway(request).await;
        }

        tokio::spawn(async move {
            if let Err(e) = invoker.invoke_oneway(request).await {
                tracing::warn!("Async oneway to {} failed: {}", invoker.locator(), e);
            }
        });
        Ok(())
    }

    /// Registers `handler` for callbacks of this client's subsystem.
    ///
    /// `handback` is attached to every callback delivered to `handler`.
    /// Returns the listener id the server knows the registration by.
    pub async fn add_listener(
        &self,
        handler: Arc<dyn CallbackHandler>,
        metadata: Metadata,
        handback: Option<Payload>,
    ) -> Result<String> {
        let invoker = self.invoker().await?;
        let listener_id = self.callbacks.register(handler, &self.subsystem, handback);
        let mut request = self
            .listener_request(InvocationKind::AddListener, &listener_id)
            .with_metadata(metadata)
            .with_meta(metadata::LISTENER_ID, &listener_id);

        if let Err(e) = self.prepare_delivery(&invoker).await {
            self.callbacks.unregister_id(&listener_id);
            return Err(e);
        }
        if self.callback_mode() == CallbackMode::Reverse {
            if let Some(callback_locator) = self.callback_server_locator().await {
                request = request.with_meta(metadata::CALLBACK_LOCATOR, callback_locator);
            }
        }

        match invoker.invoke(request).await {
            Ok(_) => {
                tracing::debug!("Listener {} registered for {}", listener_id, self.subsystem);
                Ok(listener_id)
            }
            Err(e) => {
                self.callbacks.unregister_id(&listener_id);
                Err(e)
            }
        }
    }

    /// Unregisters `handler` locally and on the server.
    pub async fn remove_listener(&self, handler: &Arc<dyn CallbackHandler>) -> Result<()> {
        let Some(listener_id) = self.callbacks.unregister(handler) else {
            return Err(RinvokeError::InvalidRequest(
                "listener is not registered".to_string(),
            ));
        };
        let invoker = self.invoker().await?;

        if self.callbacks.is_empty() {
            if let Some(session) = self.session.lock().await.as_mut() {
                if let Some(poller) = session.poller.take() {
                    poller.stop().await;
                }
            }
        }

        let request = self.listener_request(InvocationKind::RemoveListener, &listener_id);
        invoker.invoke(request).await.map(|_| ())
    }

    /// Drains the server-side store now instead of waiting for the poller.
    /// Returned callbacks carry their listener's handback and are not handed
    /// to the handlers.
    pub async fn poll_callbacks(&self) -> Result<Vec<Callback>> {
        let invoker = self.invoker().await?;
        let mut callbacks = callback::poll(invoker.as_ref()).await?;
        for callback in &mut callbacks {
            self.callbacks.attach_handback(callback);
        }
        Ok(callbacks)
    }

    fn listener_request(&self, kind: InvocationKind, listener_id: &str) -> InvocationRequest {
        InvocationRequest::new(&self.subsystem, kind, Payload::Null)
            .with_meta(metadata::LISTENER_ID, listener_id)
    }

    /// Starts whatever the callback mode needs before the first registration.
    async fn prepare_delivery(&self, invoker: &Arc<dyn ClientInvoker>) -> Result<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(RinvokeError::InvalidState(format!(
                "client for {} is not connected",
                self.locator
            )));
        };

        match self.callback_mode() {
            CallbackMode::Control => {}
            CallbackMode::Reverse => {
                if session.callback_server.is_none() {
                    let Some(locator) = &self.callback_locator else {
                        return Ok(());
                    };
                    let server = CallbackServer::start(
                        locator,
                        self.callbacks.clone(),
                        self.callback_options.clone(),
                    )
                    .await?;
                    session.callback_server = Some(server);
                }
            }
            CallbackMode::Pull => {
                if session.poller.is_none() {
                    let config = CallbackConfig::from_locator(invoker.locator());
                    session.poller = Some(CallbackPoller::spawn(
                        invoker.clone(),
                        self.callbacks.clone(),
                        config.poll_period,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn callback_server_locator(&self) -> Option<Locator> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|session| session.callback_server.as_ref())
            .map(|server| server.locator().clone())
    }
}
