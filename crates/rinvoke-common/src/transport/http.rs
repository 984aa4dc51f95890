//! HTTP transport family: `http` and `https`.
//!
//! Every invocation is a `POST` to the locator path. The body is the encoded
//! request and the `Content-Type` names the marshaller that encoded it. The
//! server answers `200` with an encoded response, or `202` with an empty
//! body for oneway invocations.
//!
//! HTTP cannot carry server-initiated traffic, so callbacks over this
//! transport are either polled or delivered through a reverse connector.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::locator::Locator;
use crate::marshal::{Marshaller, MarshallerRegistry};
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{FailureKind, InvocationKind, InvocationRequest, InvocationResponse, RemoteFailure};

use super::channel::{connect_timeout, Channel, DialOptions, Dialer};
use super::server::{wait_for_shutdown, ConnectionContext, InvocationSink, ServerOptions, ServerTransport};
use super::stream::{accept, dial};

pub type HyperRequest = Request<Incoming>;

pub type HyperResponse = Response<Full<Bytes>>;

/// A keep-alive HTTP/1.1 connection.
pub struct HttpChannel {
    locator: Locator,
    sender: SendRequest<Full<Bytes>>,
    connection: JoinHandle<()>,
    marshaller: Arc<dyn Marshaller>,
    marshallers: MarshallerRegistry,
    failed: bool,
}

impl HttpChannel {
    fn build_request(&self, request: &InvocationRequest) -> Result<Request<Full<Bytes>>> {
        let body = self.marshaller.encode_request(request)?;
        let content_type = self.marshaller.content_type();
        Request::builder()
            .method(Method::POST)
            .uri(format!("/{}", self.locator.path()))
            .header(HOST, self.locator.address())
            .header(CONTENT_TYPE, &content_type)
            .header(ACCEPT, &content_type)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RinvokeError::Transport(format!("Failed to build HTTP request: {}", e)))
    }

    async fn post(&mut self, request: Request<Full<Bytes>>) -> Result<(StatusCode, Option<String>, Bytes)> {
        let result = async {
            self.sender.ready().await?;
            let response = self.sender.send_request(request).await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, RinvokeError>((status, content_type, body))
        }
        .await;

        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

#[async_trait]
impl Channel for HttpChannel {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    async fn exchange(&mut self, request: &InvocationRequest) -> Result<InvocationResponse> {
        let http_request = self.build_request(request)?;
        let (status, content_type, body) = self.post(http_request).await?;

        if status != StatusCode::OK {
            return Err(RinvokeError::Transport(format!(
                "HTTP {} from {}: {}",
                status,
                self.locator,
                String::from_utf8_lossy(&body)
            )));
        }

        let marshaller = self.marshallers.from_content_type(content_type.as_deref())?;
        let response = marshaller.decode_response(&body)?;
        if response.id != request.id && !(response.id == 0 && !response.success) {
            return Err(RinvokeError::Transport(format!(
                "response {} does not match request {}",
                response.id, request.id
            )));
        }
        Ok(response)
    }

    async fn send_oneway(&mut self, request: &InvocationRequest) -> Result<()> {
        let http_request = self.build_request(request)?;
        let (status, _, body) = self.post(http_request).await?;
        if !status.is_success() {
            return Err(RinvokeError::Transport(format!(
                "HTTP {} from {}: {}",
                status,
                self.locator,
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.failed = true;
        self.connection.abort();
    }

    fn is_open(&self) -> bool {
        !self.failed && !self.sender.is_closed()
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

pub struct HttpDialer {
    options: DialOptions,
}

impl HttpDialer {
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, locator: &Locator) -> Result<Box<dyn Channel>> {
        let marshaller = self.options.marshallers.for_locator(locator)?;
        let stream = dial(locator, self.options.tls.as_ref(), connect_timeout(locator)).await?;
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RinvokeError::CannotConnect {
                locator: locator.to_string(),
                reason: format!("HTTP handshake failed: {}", e),
            })?;

        let peer = locator.address();
        let connection = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("HTTP connection to {} ended: {}", peer, e);
            }
        });

        tracing::debug!("Opened HTTP channel to {}", locator);
        Ok(Box::new(HttpChannel {
            locator: locator.clone(),
            sender,
            connection,
            marshaller,
            marshallers: self.options.marshallers.clone(),
            failed: false,
        }))
    }
}

/// Listener for the HTTP transport family.
pub struct HttpServer {
    listener: TcpListener,
    locator: Locator,
    local_addr: SocketAddr,
    options: Arc<ServerOptions>,
}

impl HttpServer {
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

    async fn handle_request(
        req: HyperRequest,
        sink: Arc<dyn InvocationSink>,
        ctx: Arc<ConnectionContext>,
        options: Arc<ServerOptions>,
    ) -> std::result::Result<HyperResponse, RinvokeError> {
        // Only accept POST requests
        if req.method() != Method::POST {
            return Ok(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only POST requests are supported",
            ));
        }

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let marshaller = match options.marshallers.from_content_type(content_type.as_deref()) {
            Ok(marshaller) => marshaller,
            Err(e) => return Ok(plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, &e.to_string())),
        };

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| RinvokeError::Transport(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let request = match marshaller.decode_request(&body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to decode request from {}: {}", ctx.peer(), e);
                let response = InvocationResponse::failure(0, RemoteFailure::from(&e));
                return Ok(encoded_response(marshaller.as_ref(), &response));
            }
        };

        if request.kind == InvocationKind::OpenControl {
            let response = InvocationResponse::error(
                request.id,
                FailureKind::InvalidRequest,
                "control channels require a bisocket transport",
            );
            return Ok(encoded_response(marshaller.as_ref(), &response));
        }

        match sink.handle(request, &ctx).await {
            Some(response) => Ok(encoded_response(marshaller.as_ref(), &response)),
            None => Ok(plain_response(StatusCode::ACCEPTED, "")),
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> HyperResponse {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

fn encoded_response(marshaller: &dyn Marshaller, response: &InvocationResponse) -> HyperResponse {
    let body = match marshaller.encode_response(response) {
        Ok(body) => body,
        Err(e) => {
            let fallback = InvocationResponse::failure(response.id, RemoteFailure::from(&e));
            match marshaller.encode_response(&fallback) {
                Ok(body) => body,
                Err(e) => return plain_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
    };

    let mut http_response = Response::new(Full::new(Bytes::from(body)));
    match marshaller.content_type().parse() {
        Ok(value) => {
            http_response.headers_mut().insert(CONTENT_TYPE, value);
        }
        Err(_) => tracing::warn!("Marshaller {} has an invalid content type", marshaller.id()),
    }
    http_response
}

#[async_trait]
impl ServerTransport for HttpServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn locator(&self) -> &Locator {
        &self.locator
    }

    async fn serve(&self, sink: Arc<dyn InvocationSink>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("HTTP server listening on {}", self.locator);

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

            let sink = sink.clone();
            let options = self.options.clone();
            let mut shutdown = shutdown.clone();

            tokio::task::spawn(async move {
                let stream = match accept(tcp, options.tls.as_ref()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection from {}: {}", peer, e);
                        return;
                    }
                };
                let ctx = Arc::new(ConnectionContext::new(peer.to_string()));

                let service = service_fn(move |req| {
                    Self::handle_request(req, sink.clone(), ctx.clone(), options.clone())
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::select! {
                    result = conn => {
                        if let Err(err) = result {
                            tracing::debug!("Error serving connection from {}: {}", peer, err);
                        }
                    }
                    _ = wait_for_shutdown(&mut shutdown) => {}
                }
            });
        }

        tracing::info!("HTTP server on {} stopped", self.locator);
        Ok(())
    }
}
