//! Client invokers.
//!
//! A [`ClientInvoker`] is the client half of one transport binding. Every
//! invoker runs the same state machine:
//!
//! ```text
//! Unconnected -> Connecting -> Connected -> Disconnecting -> Unconnected
//!                    |             |
//!                    +-> Failed <--+
//! ```
//!
//! `Failed` is absorbing. Entering it notifies the connection listeners and
//! drains the pool key of the invoker's locator.
//!
//! Socket and HTTP locators get a [`PooledInvoker`]. Bisocket locators get a
//! [`BisocketInvoker`], which adds a supervised control connection carrying
//! server pushes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rinvoke_common::transport::{
    connect_timeout, dial, dialer_for, read_frame, write_frame, BoxedStream, Channel,
    DialOptions, Frame, FrameKind,
};
use rinvoke_common::{
    Callback, ConnectionFailureEvent, ConnectionListeners, InvocationKind, InvocationRequest,
    InvocationResponse, Locator, Payload, RequestId, Result, RinvokeError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::callback::ListenerTable;
use crate::config::BisocketConfig;
use crate::pool::{ConnectionPool, PooledConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

#[async_trait]
pub trait ClientInvoker: Send + Sync {
    fn locator(&self) -> &Locator;

    fn state(&self) -> InvokerState;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Sends `request` and waits for its result.
    ///
    /// The wait is bounded by the request's `timeout` metadata, else the
    /// locator `timeout`. A timeout only abandons the client-side wait; the
    /// server may still run the handler to completion.
    async fn invoke(&self, request: InvocationRequest) -> Result<Payload>;

    /// Sends `request` without waiting for the handler.
    async fn invoke_oneway(&self, request: InvocationRequest) -> Result<()>;

    /// Sends a lease ping. Invokers that can keep heartbeats off the shared
    /// pool override this so pings never queue behind user calls.
    async fn heartbeat(&self, request: InvocationRequest) -> Result<Payload> {
        self.invoke(request).await
    }
}

/// Builds the invoker for `locator`'s transport.
pub fn invoker_for(
    locator: &Locator,
    client_id: &str,
    pool: Arc<ConnectionPool>,
    listeners: ConnectionListeners,
    callbacks: Arc<ListenerTable>,
) -> Arc<dyn ClientInvoker> {
    let data = Arc::new(PooledInvoker::new(
        locator.clone(),
        client_id,
        pool,
        listeners,
    ));
    if locator.transport().is_bisocket() {
        Arc::new(BisocketInvoker::new(data, callbacks))
    } else {
        data
    }
}

/// Request/response invoker over pooled connections.
pub struct PooledInvoker {
    locator: Locator,
    client_id: String,
    pool: Arc<ConnectionPool>,
    listeners: ConnectionListeners,
    state: Mutex<InvokerState>,
    /// Dedicated connection for lease pings, outside the pool.
    heartbeat: tokio::sync::Mutex<Option<Box<dyn Channel>>>,
}

impl PooledInvoker {
    pub fn new(
        locator: Locator,
        client_id: impl Into<String>,
        pool: Arc<ConnectionPool>,
        listeners: ConnectionListeners,
    ) -> Self {
        Self {
            locator,
            client_id: client_id.into(),
            pool,
            listeners,
            state: Mutex::new(InvokerState::Unconnected),
            heartbeat: tokio::sync::Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_state(&self, state: InvokerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Moves to `Failed` once, notifying listeners and draining the pool key.
    pub(crate) async fn fail(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == InvokerState::Failed {
                return;
            }
            *state = InvokerState::Failed;
        }
        tracing::warn!("Invoker for {} failed: {}", self.locator, reason);
        self.close_heartbeat().await;
        self.pool.drain(&self.locator).await;
        self.listeners.notify(&ConnectionFailureEvent::new(
            &self.client_id,
            self.locator.to_string(),
            reason,
        ));
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            InvokerState::Connected => Ok(()),
            other => Err(RinvokeError::InvalidState(format!(
                "invoker for {} is {:?}",
                self.locator, other
            ))),
        }
    }

    fn stamp(&self, mut request: InvocationRequest) -> InvocationRequest {
        if request.client_id.is_empty() {
            request.client_id = self.client_id.clone();
        }
        request
    }

    fn call_timeout(&self, request: &InvocationRequest) -> Duration {
        request
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or_else(|| connect_timeout(&self.locator))
    }

    async fn close_heartbeat(&self) {
        if let Some(mut channel) = self.heartbeat.lock().await.take() {
            channel.close().await;
        }
    }

    /// Exchanges `request` on the heartbeat connection, dialing it first if needed.
    async fn heartbeat_exchange(
        &self,
        slot: &mut Option<Box<dyn Channel>>,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse> {
        if !slot.as_ref().is_some_and(|channel| channel.is_open()) {
            let dialer = dialer_for(&self.locator, self.pool.dial_options().clone())?;
            *slot = Some(dialer.dial(&self.locator).await?);
        }
        match slot.as_mut() {
            Some(channel) => channel.exchange(request).await,
            None => Err(RinvokeError::InvalidState("no heartbeat connection".to_string())),
        }
    }

    /// Checks out a connection, giving up at the call's `deadline`.
    async fn checkout_by(&self, deadline: Instant, timeout: Duration) -> Result<PooledConnection> {
        match tokio::time::timeout_at(deadline, self.pool.checkout(&self.locator)).await {
            Ok(conn) => conn,
            Err(_) => Err(RinvokeError::InvocationTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Decides whether an I/O failure on one connection means the endpoint
    /// is gone, by trying to establish a fresh one.
    async fn after_connection_error(&self, error: &RinvokeError) {
        if !error.is_connection_fatal() || matches!(error, RinvokeError::InvocationTimeout(_)) {
            return;
        }
        match self.pool.checkout(&self.locator).await {
            Ok(conn) => self.pool.checkin(conn).await,
            Err(e) => self.fail(&format!("{} (reconnect failed: {})", error, e)).await,
        }
    }
}

#[async_trait]
impl ClientInvoker for PooledInvoker {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn state(&self) -> InvokerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connect(&self) -> Result<()> {
        match self.state() {
            InvokerState::Connected => return Ok(()),
            InvokerState::Failed => {
                return Err(RinvokeError::InvalidState(format!(
                    "invoker for {} has failed",
                    self.locator
                )))
            }
            _ => {}
        }
        self.set_state(InvokerState::Connecting);

        match self.pool.checkout(&self.locator).await {
            Ok(conn) => {
                self.pool.checkin(conn).await;
                self.set_state(InvokerState::Connected);
                tracing::debug!("Connected to {}", self.locator);
                Ok(())
            }
            Err(e @ (RinvokeError::CannotConnect { .. } | RinvokeError::PoolExhausted { .. })) => {
                self.set_state(InvokerState::Unconnected);
                Err(e)
            }
            Err(e) => {
                self.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        if self.state() == InvokerState::Failed {
            return;
        }
        self.set_state(InvokerState::Disconnecting);
        self.close_heartbeat().await;
        self.pool.drain(&self.locator).await;
        self.set_state(InvokerState::Unconnected);
        tracing::debug!("Disconnected from {}", self.locator);
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<Payload> {
        self.ensure_connected()?;
        let request = self.stamp(request);
        let timeout = self.call_timeout(&request);

        let deadline = Instant::now() + timeout;
        let mut conn = self.checkout_by(deadline, timeout).await?;
        let outcome = tokio::time::timeout_at(deadline, conn.exchange(&request)).await;
        match outcome {
            Ok(Ok(response)) => {
                self.pool.checkin(conn).await;
                response.into_result()
            }
            Ok(Err(e)) => {
                self.pool.checkin(conn).await;
                self.after_connection_error(&e).await;
                Err(e)
            }
            Err(_) => {
                // The response may still arrive; the connection can't be reused
                self.pool.discard(conn).await;
                Err(RinvokeError::InvocationTimeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn invoke_oneway(&self, request: InvocationRequest) -> Result<()> {
        self.ensure_connected()?;
        let request = self.stamp(request);
        let timeout = self.call_timeout(&request);

        let deadline = Instant::now() + timeout;
        let mut conn = self.checkout_by(deadline, timeout).await?;
        match tokio::time::timeout_at(deadline, conn.send_oneway(&request)).await {
            Ok(Ok(())) => {
                self.pool.checkin(conn).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.pool.checkin(conn).await;
                self.after_connection_error(&e).await;
                Err(e)
            }
            Err(_) => {
                self.pool.discard(conn).await;
                Err(RinvokeError::InvocationTimeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn heartbeat(&self, request: InvocationRequest) -> Result<Payload> {
        self.ensure_connected()?;
        let request = self.stamp(request);
        let timeout = self.call_timeout(&request);

        let mut slot = self.heartbeat.lock().await;
        let outcome =
            tokio::time::timeout(timeout, self.heartbeat_exchange(&mut slot, &request)).await;

        let error = match outcome {
            Ok(Ok(response)) => return response.into_result(),
            Ok(Err(e)) => e,
            Err(_) => RinvokeError::InvocationTimeout(timeout.as_millis() as u64),
        };
        if let Some(mut channel) = slot.take() {
            channel.close().await;
        }
        drop(slot);
        self.after_connection_error(&error).await;
        Err(error)
    }
}

/// Bisocket invoker: pooled data connections plus one control connection
/// on which the server pushes callbacks.
///
/// The control connection is pinged every `pingFrequency`. A ping that is
/// still unanswered at the next tick, or a read/write error, counts as a lost
/// connection; the supervisor then redials up to `maxRetries` times before
/// failing the invoker.
pub struct BisocketInvoker {
    data: Arc<PooledInvoker>,
    config: BisocketConfig,
    callbacks: Arc<ListenerTable>,
    control: tokio::sync::Mutex<Option<ControlLink>>,
}

struct ControlLink {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything the control supervisor needs, detached from the invoker.
#[derive(Clone)]
struct ControlContext {
    data: Arc<PooledInvoker>,
    config: BisocketConfig,
    callbacks: Arc<ListenerTable>,
    options: DialOptions,
}

enum ControlExit {
    Shutdown,
    Lost(String),
}

impl BisocketInvoker {
    pub fn new(data: Arc<PooledInvoker>, callbacks: Arc<ListenerTable>) -> Self {
        let config = BisocketConfig::from_locator(data.locator());
        Self {
            data,
            config,
            callbacks,
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether the control supervisor is running.
    pub async fn has_control(&self) -> bool {
        self.control
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| !link.task.is_finished())
    }

    async fn stop_control(&self) {
        if let Some(link) = self.control.lock().await.take() {
            let _ = link.shutdown.send(true);
            let _ = link.task.await;
        }
    }
}

#[async_trait]
impl ClientInvoker for BisocketInvoker {
    fn locator(&self) -> &Locator {
        self.data.locator()
    }

    fn state(&self) -> InvokerState {
        self.data.state()
    }

    async fn connect(&self) -> Result<()> {
        self.data.connect().await?;

        let mut control = self.control.lock().await;
        if control.as_ref().is_some_and(|link| !link.task.is_finished()) {
            return Ok(());
        }

        let ctx = ControlContext {
            data: self.data.clone(),
            config: self.config.clone(),
            callbacks: self.callbacks.clone(),
            options: self.data.pool.dial_options().clone(),
        };
        let stream = match open_control(&ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                drop(control);
                self.data.disconnect().await;
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(stream, ctx, shutdown_rx));
        *control = Some(ControlLink { shutdown, task });
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop_control().await;
        self.data.disconnect().await;
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<Payload> {
        self.data.invoke(request).await
    }

    async fn invoke_oneway(&self, request: InvocationRequest) -> Result<()> {
        self.data.invoke_oneway(request).await
    }

    async fn heartbeat(&self, request: InvocationRequest) -> Result<Payload> {
        self.data.heartbeat(request).await
    }
}

/// Dials the control connection and performs the `OpenControl` handshake.
async fn open_control(ctx: &ControlContext) -> Result<BoxedStream> {
    let locator = ctx.data.locator();
    let timeout = connect_timeout(locator);
    let marshaller = ctx.options.marshallers.for_locator(locator)?;

    let mut stream = dial(locator, ctx.options.tls.as_ref(), timeout).await?;
    let open = InvocationRequest::control(InvocationKind::OpenControl)
        .with_client_id(ctx.data.client_id());
    write_frame(&mut stream, &Frame::request(marshaller.as_ref(), &open)?).await?;

    let ack = match tokio::time::timeout(timeout, read_frame(&mut stream)).await {
        Ok(ack) => ack?,
        Err(_) => {
            return Err(RinvokeError::CannotConnect {
                locator: locator.to_string(),
                reason: "control handshake timed out".to_string(),
            })
        }
    };
    let Some(ack) = ack else {
        return Err(RinvokeError::ConnectionFailure(format!(
            "{} closed the control connection during the handshake",
            locator
        )));
    };
    ack.decode_response(&ctx.options.marshallers)?.into_result()?;

    tracing::debug!("Control connection to {} open for {}", locator, ctx.data.client_id());
    Ok(stream)
}

async fn supervise(stream: BoxedStream, ctx: ControlContext, mut shutdown: watch::Receiver<bool>) {
    let mut stream = stream;
    loop {
        let reason = match run_control(stream, &ctx, &mut shutdown).await {
            ControlExit::Shutdown => return,
            ControlExit::Lost(reason) => reason,
        };
        tracing::warn!("Control connection to {} lost: {}", ctx.data.locator(), reason);

        let mut reopened = None;
        for attempt in 1..=ctx.config.max_retries {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return,
                _ = tokio::time::sleep(ctx.config.ping_frequency) => {}
            }
            match open_control(&ctx).await {
                Ok(s) => {
                    tracing::info!(
                        "Control connection to {} restored after {} attempt(s)",
                        ctx.data.locator(),
                        attempt
                    );
                    reopened = Some(s);
                    break;
                }
                Err(e) => tracing::debug!(
                    "Control reconnect {}/{} to {} failed: {}",
                    attempt,
                    ctx.config.max_retries,
                    ctx.data.locator(),
                    e
                ),
            }
        }

        match reopened {
            Some(s) => stream = s,
            None => {
                ctx.data
                    .fail(&format!(
                        "control connection lost after {} reconnect attempts: {}",
                        ctx.config.max_retries, reason
                    ))
                    .await;
                return;
            }
        }
    }
}

/// Pumps one control connection until it is lost or shutdown is requested.
async fn run_control(
    stream: BoxedStream,
    ctx: &ControlContext,
    shutdown: &mut watch::Receiver<bool>,
) -> ControlExit {
    let locator = ctx.data.locator();
    let marshaller = match ctx.options.marshallers.for_locator(locator) {
        Ok(marshaller) => marshaller,
        Err(e) => return ControlExit::Lost(e.to_string()),
    };

    let (mut reader, mut writer) = tokio::io::split(stream);
    // Frame reads are not cancel-safe, so they get their own task
    let (frame_tx, mut frames) = mpsc::channel::<Result<Option<Frame>>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let next = read_frame(&mut reader).await;
            let done = !matches!(next, Ok(Some(_)));
            if frame_tx.send(next).await.is_err() || done {
                break;
            }
        }
    });

    let mut ticker = tokio::time::interval(ctx.config.ping_frequency);
    ticker.tick().await;
    let mut awaiting_pong: Option<RequestId> = None;

    let exit = loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => break ControlExit::Shutdown,
            _ = ticker.tick() => {
                if let Some(id) = awaiting_pong {
                    break ControlExit::Lost(format!("ping {} unanswered", id));
                }
                let ping = InvocationRequest::control(InvocationKind::Ping)
                    .with_client_id(ctx.data.client_id());
                let frame = match Frame::request(marshaller.as_ref(), &ping) {
                    Ok(frame) => frame,
                    Err(e) => break ControlExit::Lost(e.to_string()),
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    break ControlExit::Lost(e.to_string());
                }
                awaiting_pong = Some(ping.id);
            }
            frame = frames.recv() => {
                let frame = match frame {
                    Some(Ok(Some(frame))) => frame,
                    Some(Ok(None)) | None => {
                        break ControlExit::Lost("closed by server".to_string())
                    }
                    Some(Err(e)) => break ControlExit::Lost(e.to_string()),
                };
                match frame.kind {
                    FrameKind::Request => deliver_push(&frame, ctx),
                    FrameKind::Response => match frame.decode_response(&ctx.options.marshallers) {
                        Ok(response) if Some(response.id) == awaiting_pong => awaiting_pong = None,
                        Ok(response) => {
                            tracing::debug!("Ignoring uncorrelated control response {}", response.id)
                        }
                        Err(e) => tracing::warn!("Undecodable control response from {}: {}", locator, e),
                    },
                }
            }
        }
    };

    reader_task.abort();
    exit
}

fn deliver_push(frame: &Frame, ctx: &ControlContext) {
    let request = match frame.decode_request(&ctx.options.marshallers) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Undecodable push from {}: {}", ctx.data.locator(), e);
            return;
        }
    };
    if request.kind != InvocationKind::Callback {
        tracing::debug!("Ignoring {:?} pushed on control connection", request.kind);
        return;
    }
    match serde_json::from_value::<Callback>(request.payload) {
        Ok(callback) => {
            ctx.callbacks.deliver(callback);
        }
        Err(e) => tracing::warn!("Malformed callback from {}: {}", ctx.data.locator(), e),
    }
}

/// Resolves once shutdown is flipped or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
