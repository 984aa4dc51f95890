use thiserror::Error;

#[derive(Error, Debug)]
pub enum RinvokeError {
    #[error("Malformed locator '{locator}': {reason}")]
    MalformedLocator { locator: String, reason: String },

    #[error("Cannot connect to {locator}: {reason}")]
    CannotConnect { locator: String, reason: String },

    #[error("Invocation timed out after {0}ms")]
    InvocationTimeout(u64),

    #[error("Connection pool for {locator} exhausted after waiting {waited_ms}ms")]
    PoolExhausted { locator: String, waited_ms: u64 },

    #[error("No handler registered for subsystem '{0}'")]
    NoSuchHandler(String),

    #[error("Marshalling error: {0}")]
    Marshalling(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RinvokeError {
    /// Whether a fresh connection might succeed where this attempt failed.
    ///
    /// Remote failures carried in a response (`NoSuchHandler`, `HandlerFailure`,
    /// `Marshalling`, `InvalidRequest`) and locator errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RinvokeError::CannotConnect { .. }
                | RinvokeError::ConnectionFailure(_)
                | RinvokeError::Transport(_)
                | RinvokeError::Io(_)
        )
    }

    /// Whether the error leaves the underlying connection unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RinvokeError::ConnectionFailure(_)
                | RinvokeError::Framing(_)
                | RinvokeError::Transport(_)
                | RinvokeError::Tls(_)
                | RinvokeError::Io(_)
                | RinvokeError::InvocationTimeout(_)
        )
    }
}

impl From<serde_json::Error> for RinvokeError {
    fn from(err: serde_json::Error) -> Self {
        RinvokeError::Marshalling(err.to_string())
    }
}

impl From<postcard::Error> for RinvokeError {
    fn from(err: postcard::Error) -> Self {
        RinvokeError::Marshalling(err.to_string())
    }
}

impl From<rustls::Error> for RinvokeError {
    fn from(err: rustls::Error) -> Self {
        RinvokeError::Tls(err.to_string())
    }
}

impl From<hyper::Error> for RinvokeError {
    fn from(err: hyper::Error) -> Self {
        RinvokeError::Transport(err.to_string())
    }
}

/// Maps I/O errors onto the transport taxonomy.
///
/// - Timeouts become `InvocationTimeout` carrying `timeout_ms`
/// - Resets, aborts and unexpected EOF become `ConnectionFailure`
/// - Everything else stays `Io`
pub fn map_io_error(err: std::io::Error, context: &str, timeout_ms: u64) -> RinvokeError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            RinvokeError::InvocationTimeout(timeout_ms)
        }
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            RinvokeError::ConnectionFailure(format!("{}: connection lost", context))
        }
        _ => RinvokeError::Io(err),
    }
}

pub type Result<T> = std::result::Result<T, RinvokeError>;
