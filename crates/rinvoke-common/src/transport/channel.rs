//! Client-side transport contract.
//!
//! A [`Dialer`] opens [`Channel`]s to one kind of endpoint. A channel carries
//! strictly alternating request/response exchanges, which is what correlates
//! a response with its request on the socket and HTTP transports alike.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::locator::{params, Locator};
use crate::marshal::MarshallerRegistry;
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{InvocationKind, InvocationRequest, InvocationResponse};

use super::http::HttpDialer;
use super::socket::SocketDialer;
use super::tls::TlsContext;

/// Connect timeout used when the locator has no `timeout`.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;

#[async_trait]
pub trait Channel: Send {
    fn locator(&self) -> &Locator;

    /// Sends `request` and waits for the correlated response.
    async fn exchange(&mut self, request: &InvocationRequest) -> Result<InvocationResponse>;

    /// Sends `request` without waiting for a response.
    async fn send_oneway(&mut self, request: &InvocationRequest) -> Result<()>;

    /// Verifies the peer still answers.
    async fn probe(&mut self) -> Result<()> {
        let ping = InvocationRequest::control(InvocationKind::Ping);
        self.exchange(&ping).await?.into_result().map(|_| ())
    }

    async fn close(&mut self);

    /// `false` once the channel saw a fatal error or was closed.
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, locator: &Locator) -> Result<Box<dyn Channel>>;
}

/// Everything a dialer needs besides the target locator.
#[derive(Clone, Debug, Default)]
pub struct DialOptions {
    pub tls: Option<TlsContext>,
    pub marshallers: MarshallerRegistry,
}

impl DialOptions {
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Picks the dialer for the locator's transport.
///
/// Bisocket data connections speak the socket protocol, so both bisocket
/// schemes get a socket dialer.
pub fn dialer_for(locator: &Locator, options: DialOptions) -> Result<Arc<dyn Dialer>> {
    let transport = locator.transport();
    if transport.is_tls() && options.tls.is_none() {
        return Err(RinvokeError::Tls(format!("{} requires a TLS context", transport)));
    }
    if transport.is_http() {
        Ok(Arc::new(HttpDialer::new(options)))
    } else {
        Ok(Arc::new(SocketDialer::new(options)))
    }
}

/// Connect timeout read from the locator `timeout`.
pub fn connect_timeout(locator: &Locator) -> Duration {
    Duration::from_millis(
        locator
            .param_as(params::TIMEOUT)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
    )
}
