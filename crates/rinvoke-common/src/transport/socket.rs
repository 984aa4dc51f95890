//! Socket transport family: `socket`, `sslsocket`, `bisocket`, `sslbisocket`.
//!
//! Client and server exchange [`Frame`]s over one stream. Data connections
//! alternate strictly between one request and its response. A bisocket
//! client may additionally turn a connection into its control channel with
//! an `OpenControl` request; from then on the server writes `Callback`
//! request frames down it whenever it likes, and the client sends `Ping`
//! requests that the server answers on the same stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::locator::Locator;
use crate::marshal::{JsonMarshaller, Marshaller, MarshallerRegistry, DEFAULT_MARSHALLER};
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{
    FailureKind, InvocationKind, InvocationRequest, InvocationResponse, RemoteFailure,
};

use super::channel::{connect_timeout, Channel, DialOptions, Dialer};
use super::frame::{read_frame, write_frame, Frame, FrameKind};
use super::server::{
    wait_for_shutdown, ConnectionContext, ControlChannel, InvocationSink, ServerOptions,
    ServerTransport,
};
use super::stream::{accept, dial, BoxedStream};

/// A data connection over the socket protocol.
pub struct SocketChannel {
    locator: Locator,
    stream: Option<BoxedStream>,
    marshaller: Arc<dyn Marshaller>,
    marshallers: MarshallerRegistry,
}

impl SocketChannel {
    pub fn new(locator: Locator, stream: BoxedStream, marshallers: MarshallerRegistry) -> Result<Self> {
        let marshaller = marshallers.for_locator(&locator)?;
        Ok(Self {
            locator,
            stream: Some(stream),
            marshaller,
            marshallers,
        })
    }

    /// Drops the stream if `result` means it can no longer be trusted.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                tracing::debug!("Closing channel to {}: {}", self.locator, e);
                self.stream = None;
            }
        }
        result
    }
}

#[async_trait]
impl Channel for SocketChannel {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    async fn exchange(&mut self, request: &InvocationRequest) -> Result<InvocationResponse> {
        let frame = Frame::request(self.marshaller.as_ref(), request)?;
        let registry = &self.marshallers;
        let locator = &self.locator;
        let stream = self.stream.as_mut().ok_or_else(|| closed_error(locator))?;

        let result = async {
            write_frame(stream, &frame).await?;
            let reply = read_frame(stream).await?.ok_or_else(|| {
                RinvokeError::ConnectionFailure("connection closed by peer".to_string())
            })?;
            let response = reply.decode_response(registry)?;
            // Id 0 marks a request the server could not decode at all
            if response.id != request.id && !(response.id == 0 && !response.success) {
                return Err(RinvokeError::Framing(format!(
                    "response {} does not match request {}",
                    response.id, request.id
                )));
            }
            Ok::<_, RinvokeError>(response)
        }
        .await;

        self.track(result)
    }

    async fn send_oneway(&mut self, request: &InvocationRequest) -> Result<()> {
        let frame = Frame::request(self.marshaller.as_ref(), request)?;
        let locator = &self.locator;
        let stream = self.stream.as_mut().ok_or_else(|| closed_error(locator))?;
        let result = write_frame(stream, &frame).await;
        self.track(result)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn closed_error(locator: &Locator) -> RinvokeError {
    RinvokeError::ConnectionFailure(format!("channel to {} is closed", locator))
}

pub struct SocketDialer {
    options: DialOptions,
}

impl SocketDialer {
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self, locator: &Locator) -> Result<Box<dyn Channel>> {
        let stream = dial(locator, self.options.tls.as_ref(), connect_timeout(locator)).await?;
        tracing::debug!("Opened socket channel to {}", locator);
        Ok(Box::new(SocketChannel::new(
            locator.clone(),
            stream,
            self.options.marshallers.clone(),
        )?))
    }
}

/// Listener for the socket transport family.
pub struct SocketServer {
    listener: TcpListener,
    locator: Locator,
    local_addr: SocketAddr,
    options: Arc<ServerOptions>,
}

impl SocketServer {
    /// Binds to the locator's address. Port 0 picks a free port.
    pub async fn bind(locator: &Locator, options: ServerOptions) -> Result<Self> {
        let address = locator.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| RinvokeError::Transport(format!("Failed to bind to {}: {}", address, e)))?;
        let local_addr = listener.local_addr().map_err(|e| {
            RinvokeError::Transport(format!("Failed to get local address: {}", e))
        })?;

        Ok(Self {
            listener,
            locator: locator.with_address(locator.host(), local_addr.port()),
            local_addr,
            options: Arc::new(options),
        })
    }
}

#[async_trait]
impl ServerTransport for SocketServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn locator(&self) -> &Locator {
        &self.locator
    }

    async fn serve(&self, sink: Arc<dyn InvocationSink>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Socket server listening on {}", self.locator);
        let bisocket = self.locator.transport().is_bisocket();

        loop {
            let (tcp, peer) = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            tracing::debug!("Connection established from {}", peer);
            let sink = sink.clone();
            let options = self.options.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(tcp, peer, sink, options, bisocket, shutdown).await {
                    tracing::warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }

        tracing::info!("Socket server on {} stopped", self.locator);
        Ok(())
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn InvocationSink>,
    options: Arc<ServerOptions>,
    bisocket: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut stream = accept(tcp, options.tls.as_ref()).await?;
    let ctx = ConnectionContext::new(peer.to_string());
    let registry = &options.marshallers;

    loop {
        let next = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            _ = ctx.closed() => {
                tracing::debug!("Closing connection from {} on server request", peer);
                return Ok(());
            }
            next = read_idle(&mut stream, options.idle_timeout) => next?,
        };
        let frame = match next {
            Idle::Frame(frame) => frame,
            Idle::Closed => {
                tracing::debug!("Connection from {} closed by peer", peer);
                return Ok(());
            }
            Idle::TimedOut => {
                tracing::debug!("Closing idle connection from {}", peer);
                return Ok(());
            }
        };

        if frame.kind != FrameKind::Request {
            return Err(RinvokeError::Framing(format!(
                "unexpected {:?} frame from {}",
                frame.kind, peer
            )));
        }

        let (marshaller, request) = match decode(&frame, registry) {
            Ok(decoded) => decoded,
            Err((marshaller, e)) => {
                tracing::warn!("Failed to decode request from {}: {}", peer, e);
                let response = InvocationResponse::failure(0, RemoteFailure::from(&e));
                write_response(&mut stream, marshaller.as_ref(), &response).await?;
                continue;
            }
        };

        if request.kind == InvocationKind::OpenControl {
            if !bisocket {
                let response = InvocationResponse::error(
                    request.id,
                    FailureKind::InvalidRequest,
                    "control channels require a bisocket transport",
                );
                write_response(&mut stream, marshaller.as_ref(), &response).await?;
                continue;
            }
            if request.client_id.is_empty() {
                let response = InvocationResponse::error(
                    request.id,
                    FailureKind::InvalidRequest,
                    "control channel requires a client id",
                );
                write_response(&mut stream, marshaller.as_ref(), &response).await?;
                continue;
            }
            let ack = InvocationResponse::success(request.id, serde_json::Value::Null);
            write_response(&mut stream, marshaller.as_ref(), &ack).await?;
            return serve_control(stream, ctx, request.client_id, marshaller, sink, options, shutdown)
                .await;
        }

        if let Some(response) = sink.handle(request, &ctx).await {
            write_response(&mut stream, marshaller.as_ref(), &response).await?;
        }
    }
}

enum Idle {
    Frame(Frame),
    Closed,
    TimedOut,
}

async fn read_idle(stream: &mut BoxedStream, idle_timeout: Option<Duration>) -> Result<Idle> {
    let read = async {
        Ok(match read_frame(stream).await? {
            Some(frame) => Idle::Frame(frame),
            None => Idle::Closed,
        })
    };
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .unwrap_or(Ok(Idle::TimedOut)),
        None => read.await,
    }
}

/// Decodes a request frame, reporting which marshaller to answer with on failure.
fn decode(
    frame: &Frame,
    registry: &MarshallerRegistry,
) -> std::result::Result<(Arc<dyn Marshaller>, InvocationRequest), (Arc<dyn Marshaller>, RinvokeError)> {
    let marshaller = match registry.get(&frame.marshaller) {
        Ok(marshaller) => marshaller,
        Err(e) => {
            let fallback = registry
                .get(DEFAULT_MARSHALLER)
                .unwrap_or_else(|_| Arc::new(JsonMarshaller));
            return Err((fallback, e));
        }
    };
    match marshaller.decode_request(&frame.body) {
        Ok(request) => Ok((marshaller, request)),
        Err(e) => Err((marshaller, e)),
    }
}

async fn write_response<W>(
    writer: &mut W,
    marshaller: &dyn Marshaller,
    response: &InvocationResponse,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = match Frame::response(marshaller, response) {
        Ok(frame) => frame,
        Err(e) => Frame::response(
            marshaller,
            &InvocationResponse::failure(response.id, RemoteFailure::from(&e)),
        )?,
    };
    write_frame(writer, &frame).await
}

/// Runs a bisocket control connection until either side goes away.
async fn serve_control(
    stream: BoxedStream,
    ctx: ConnectionContext,
    client_id: String,
    marshaller: Arc<dyn Marshaller>,
    sink: Arc<dyn InvocationSink>,
    options: Arc<ServerOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!("Control channel opened for client {} from {}", client_id, ctx.peer());
    let (channel, mut callbacks) = ControlChannel::new(client_id.clone(), ctx.id());
    sink.open_control(channel);

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

    let result = loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
            _ = ctx.closed() => break Ok(()),
            callback = callbacks.recv() => {
                let Some(callback) = callback else {
                    // Replaced by a newer control connection or dropped by the server
                    break Ok(());
                };
                let payload = match serde_json::to_value(&callback) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable callback for {}: {}", client_id, e);
                        continue;
                    }
                };
                let push = InvocationRequest::new(callback.subsystem.clone(), InvocationKind::Callback, payload)
                    .with_client_id(client_id.clone());
                let frame = match Frame::request(marshaller.as_ref(), &push) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable callback for {}: {}", client_id, e);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    break Err(e);
                }
            }
            frame = frames.recv() => {
                let frame = match frame {
                    Some(Ok(Some(frame))) => frame,
                    Some(Ok(None)) | None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                };
                if frame.kind != FrameKind::Request {
                    continue;
                }
                let (reply_with, request) = match decode(&frame, &options.marshallers) {
                    Ok(decoded) => decoded,
                    Err((reply_with, e)) => {
                        let response = InvocationResponse::failure(0, RemoteFailure::from(&e));
                        if let Err(e) = write_response(&mut writer, reply_with.as_ref(), &response).await {
                            break Err(e);
                        }
                        continue;
                    }
                };
                if let Some(response) = sink.handle(request, &ctx).await {
                    if let Err(e) = write_response(&mut writer, reply_with.as_ref(), &response).await {
                        break Err(e);
                    }
                }
            }
        }
    };

    reader_task.abort();
    sink.close_control(&client_id, ctx.id());
    tracing::info!("Control channel for client {} closed", client_id);
    result
}
