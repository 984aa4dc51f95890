//! Server-side transport contract.
//!
//! A [`ServerTransport`] owns a listening socket and turns wire traffic into
//! calls on an [`InvocationSink`]. The sink (the dispatcher) never sees bytes,
//! and transports never see handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::locator::Locator;
use crate::marshal::MarshallerRegistry;
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{Callback, InvocationRequest, InvocationResponse};

use super::http::HttpServer;
use super::socket::SocketServer;
use super::tls::TlsContext;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Per-connection state handed to the sink with every request.
///
/// Oneway work enqueued here runs strictly in arrival order on a task owned
/// by the connection, so the read loop never waits for it.
///
/// The sink can keep a [`ConnectionCloser`] to end the connection later,
/// e.g. when the lease of the client using it expires.
pub struct ConnectionContext {
    id: u64,
    peer: String,
    oneway: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    close: Arc<watch::Sender<bool>>,
    closing: watch::Receiver<bool>,
}

/// Handle that asks a server connection to close.
#[derive(Clone, Debug)]
pub struct ConnectionCloser(Arc<watch::Sender<bool>>);

impl ConnectionCloser {
    pub fn close(&self) {
        let _ = self.0.send(true);
    }

    /// `true` once the connection has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.0.is_closed()
    }
}

impl ConnectionContext {
    pub fn new(peer: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        let (close, closing) = watch::channel(false);
        Self {
            id: CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            oneway: tx,
            close: Arc::new(close),
            closing,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser(self.close.clone())
    }

    /// Resolves once a [`ConnectionCloser`] asked this connection to close.
    pub async fn closed(&self) {
        let mut closing = self.closing.clone();
        wait_for_shutdown(&mut closing).await;
    }

    /// Queues `job` behind every oneway job previously queued on this connection.
    pub fn enqueue_oneway(&self, job: BoxFuture<'static, ()>) {
        if self.oneway.send(job).is_err() {
            tracing::warn!("Oneway queue for {} closed, dropping job", self.peer);
        }
    }
}

/// Capacity of a control channel's outbound callback queue.
pub const CONTROL_QUEUE_CAPACITY: usize = 1024;

/// Write end of a client's bisocket control connection.
#[derive(Clone, Debug)]
pub struct ControlChannel {
    client_id: String,
    connection_id: u64,
    tx: mpsc::Sender<Callback>,
}

impl ControlChannel {
    pub fn new(client_id: impl Into<String>, connection_id: u64) -> (Self, mpsc::Receiver<Callback>) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        (
            Self {
                client_id: client_id.into(),
                connection_id,
                tx,
            },
            rx,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues a callback for delivery down the control connection.
    pub async fn push(&self, callback: Callback) -> Result<()> {
        self.tx.send(callback).await.map_err(|_| {
            RinvokeError::ConnectionFailure(format!(
                "control channel for client {} is closed",
                self.client_id
            ))
        })
    }
}

/// Receiver of decoded invocations.
#[async_trait]
pub trait InvocationSink: Send + Sync + 'static {
    /// Handles one request. `None` means nothing is written back.
    async fn handle(
        &self,
        request: InvocationRequest,
        ctx: &ConnectionContext,
    ) -> Option<InvocationResponse>;

    /// A client turned a connection into its control channel.
    fn open_control(&self, channel: ControlChannel);

    /// The control connection `connection_id` of `client_id` went away.
    fn close_control(&self, client_id: &str, connection_id: u64);
}

#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// The bind locator with the actual bound port filled in.
    fn locator(&self) -> &Locator;

    /// Accepts connections until `shutdown` flips to `true`.
    async fn serve(&self, sink: Arc<dyn InvocationSink>, shutdown: watch::Receiver<bool>) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    pub tls: Option<TlsContext>,
    pub marshallers: MarshallerRegistry,
    /// Close socket connections that stay silent this long.
    pub idle_timeout: Option<Duration>,
}

/// Binds the listener matching the locator's transport.
pub async fn bind(locator: &Locator, options: ServerOptions) -> Result<Box<dyn ServerTransport>> {
    if locator.transport().is_tls() && options.tls.is_none() {
        return Err(RinvokeError::Tls(format!(
            "{} requires a TLS context",
            locator.transport()
        )));
    }

    if locator.transport().is_http() {
        Ok(Box::new(HttpServer::bind(locator, options).await?))
    } else {
        Ok(Box::new(SocketServer::bind(locator, options).await?))
    }
}

pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_oneway_jobs_run_in_order() {
        let ctx = ConnectionContext::new("test-peer");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for i in 0..5u64 {
            let seen = seen.clone();
            ctx.enqueue_oneway(Box::pin(async move {
                // Earlier jobs sleep longer; order must still hold
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                seen.lock().unwrap().push(i);
            }));
        }
        ctx.enqueue_oneway(Box::pin(async move {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let a = ConnectionContext::new("a");
        let b = ConnectionContext::new("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.peer(), "a");
    }

    #[tokio::test]
    async fn test_closer_wakes_connection() {
        let ctx = ConnectionContext::new("peer");
        let closer = ctx.closer();
        assert!(!closer.is_finished());

        closer.close();
        tokio::time::timeout(Duration::from_secs(1), ctx.closed())
            .await
            .unwrap();

        drop(ctx);
        assert!(closer.is_finished());
    }

    #[tokio::test]
    async fn test_control_channel_push_after_close() {
        let (channel, rx) = ControlChannel::new("client-1", 7);
        drop(rx);
        assert!(channel.is_closed());
        let err = channel
            .push(Callback::new("l", "s", serde_json::json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RinvokeError::ConnectionFailure(_)));
    }

    #[tokio::test]
    async fn test_bind_tls_without_context() {
        let locator: Locator = "sslsocket://127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            bind(&locator, ServerOptions::default()).await,
            Err(RinvokeError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_on_flip() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
