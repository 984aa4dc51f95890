//! Wire transports.
//!
//! # Architecture
//!
//! - **Client side**: a [`Dialer`] per transport opens [`Channel`]s; a channel
//!   runs strictly alternating request/response exchanges
//! - **Server side**: a [`ServerTransport`] per transport feeds decoded
//!   requests into an [`InvocationSink`] and writes back what it returns
//! - **Selection**: [`dialer_for`] and [`bind`] pick the implementation from
//!   the locator scheme
//!
//! # Transports
//!
//! | scheme | client | server |
//! |---|---|---|
//! | `socket`, `sslsocket` | [`SocketChannel`] | [`SocketServer`] |
//! | `bisocket`, `sslbisocket` | [`SocketChannel`] plus a control connection | [`SocketServer`] |
//! | `http`, `https` | [`HttpChannel`] | [`HttpServer`] |
//!
//! # Message Size Limits
//!
//! Socket frames are capped at [`frame::MAX_MESSAGE_SIZE`] (100 MB).

pub mod channel;
pub mod frame;
pub mod http;
pub mod server;
pub mod socket;
pub mod stream;
pub mod tls;

pub use channel::{connect_timeout, dialer_for, Channel, DialOptions, Dialer};
pub use frame::{read_frame, write_frame, Frame, FrameKind, MAX_MESSAGE_SIZE};
pub use http::{HttpChannel, HttpDialer, HttpServer};
pub use server::{
    bind, ConnectionCloser, ConnectionContext, ControlChannel, InvocationSink, ServerOptions,
    ServerTransport,
};
pub use socket::{SocketChannel, SocketDialer, SocketServer};
pub use stream::{dial, BoxedStream, IoStream};
pub use tls::TlsContext;
