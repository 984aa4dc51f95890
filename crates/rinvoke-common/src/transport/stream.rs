//! Byte streams shared by the socket and HTTP transports.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::locator::Locator;
use crate::protocol::error::{Result, RinvokeError};

use super::tls::TlsContext;

/// A plain or TLS byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn IoStream>;

/// Opens a stream to `locator`, wrapping it in TLS for TLS transports.
///
/// # Errors
///
/// - `CannotConnect` if resolution, the TCP connect or the TLS handshake
///   fails or does not finish within `connect_timeout`
/// - `Tls` if a TLS transport is requested without a client configuration
pub async fn dial(
    locator: &Locator,
    tls: Option<&TlsContext>,
    connect_timeout: Duration,
) -> Result<BoxedStream> {
    let cannot_connect = |reason: String| RinvokeError::CannotConnect {
        locator: locator.to_string(),
        reason,
    };

    let connector = match (locator.transport().is_tls(), tls) {
        (true, Some(tls)) => Some((tls.connector()?, tls.server_name(locator.host())?)),
        (true, None) => {
            return Err(RinvokeError::Tls(format!(
                "{} requires a TLS context",
                locator.transport()
            )))
        }
        (false, _) => None,
    };

    let address = locator.address();
    let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(cannot_connect(e.to_string())),
        Err(_) => {
            return Err(cannot_connect(format!(
                "connect timed out after {}ms",
                connect_timeout.as_millis()
            )))
        }
    };
    tcp.set_nodelay(true)?;

    let Some((connector, server_name)) = connector else {
        return Ok(Box::new(tcp));
    };

    match tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(cannot_connect(format!("TLS handshake failed: {}", e))),
        Err(_) => Err(cannot_connect("TLS handshake timed out".to_string())),
    }
}

/// Completes the server side of an accepted connection.
pub async fn accept(tcp: TcpStream, tls: Option<&TlsContext>) -> Result<BoxedStream> {
    let _ = tcp.set_nodelay(true);
    match tls {
        Some(tls) => {
            let stream = tls
                .acceptor()?
                .accept(tcp)
                .await
                .map_err(|e| RinvokeError::Tls(format!("TLS accept failed: {}", e)))?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}
