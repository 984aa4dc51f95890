//! Endpoint addressing.
//!
//! A [`Locator`] identifies a remote endpoint and carries every connection
//! parameter the transports and the connection pool read at connect time.
//!
//! # Format
//!
//! ```text
//! scheme://host:port/path?key1=val1&key2=val2
//! ```
//!
//! - `scheme` selects the transport (see [`TransportKind`])
//! - `host` may be a DNS name, an IPv4 address or a bracketed IPv6 address
//! - `port` defaults to the transport's well-known port when omitted
//! - query values are URL-decoded on parse and re-encoded on display
//!
//! Parameters form an ordered multimap: insertion order is preserved for
//! display, lookup is an exact, case-sensitive key match returning the first
//! value. Equality and hashing ignore parameter order.
//!
//! # Example
//!
//! ```
//! use rinvoke_common::locator::{Locator, TransportKind, params};
//!
//! let locator: Locator = "socket://localhost:5400/?serializationtype=json&timeout=2000"
//!     .parse()
//!     .unwrap();
//! assert_eq!(locator.transport(), TransportKind::Socket);
//! assert_eq!(locator.param_as::<u64>(params::TIMEOUT), Some(2000));
//! assert_eq!(locator.to_string().parse::<Locator>().unwrap(), locator);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use url::form_urlencoded;

use crate::protocol::error::{Result, RinvokeError};

/// Locator parameter keys interpreted by the runtime.
pub mod params {
    /// Marshaller id (`json`, `postcard`).
    pub const SERIALIZATION_TYPE: &str = "serializationtype";
    /// Invocation timeout in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Maximum pooled connections per locator.
    pub const CLIENT_MAX_POOL_SIZE: &str = "clientMaxPoolSize";
    /// Idle eviction threshold for pooled connections, in milliseconds.
    pub const IDLE_TIMEOUT: &str = "idleTimeout";
    /// Probe pooled connections before handing them out.
    pub const CHECK_CONNECTION: &str = "socket.check_connection";
    /// Retry budget for connection checks and connection establishment.
    pub const NUMBER_OF_CALL_RETRIES: &str = "numberOfCallRetries";
    /// Enable the client heartbeat.
    pub const CLIENT_LEASE: &str = "clientLease";
    /// Heartbeat period in milliseconds.
    pub const LEASE_PERIOD: &str = "leasePeriod";
    /// `!`-delimited list of `host:port` failover candidates.
    pub const CONNECT_HOMES: &str = "connectHomes";
    /// Bisocket control channel PING interval in milliseconds.
    pub const PING_FREQUENCY: &str = "pingFrequency";
    /// Bisocket control channel reconnect attempts.
    pub const MAX_RETRIES: &str = "maxRetries";
    /// Pull-callback poll interval in milliseconds.
    pub const CALLBACK_POLL_PERIOD: &str = "callbackPollPeriod";
    /// Per-client callback store bound.
    pub const CALLBACK_STORE_CAPACITY: &str = "callbackStoreCapacity";
    /// Server worker pool size.
    pub const MAX_POOL_SIZE: &str = "maxPoolSize";
}

/// Wire transport selected by the locator scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Length-prefixed frames over plain TCP.
    Socket,
    /// Length-prefixed frames over TLS.
    SslSocket,
    /// POST requests over HTTP/1.1.
    Http,
    /// POST requests over HTTP/1.1 with TLS.
    Https,
    /// Socket transport with a client-opened control connection for push callbacks.
    Bisocket,
    /// Bisocket over TLS.
    SslBisocket,
}

impl TransportKind {
    /// Every supported transport.
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Socket,
        TransportKind::SslSocket,
        TransportKind::Http,
        TransportKind::Https,
        TransportKind::Bisocket,
        TransportKind::SslBisocket,
    ];

    /// The URI scheme for this transport.
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::SslSocket => "sslsocket",
            TransportKind::Http => "http",
            TransportKind::Https => "https",
            TransportKind::Bisocket => "bisocket",
            TransportKind::SslBisocket => "sslbisocket",
        }
    }

    /// Looks up a transport by scheme (case-insensitive).
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.scheme().eq_ignore_ascii_case(scheme))
    }

    /// Port used when the locator omits one.
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Http => 80,
            TransportKind::Https => 443,
            TransportKind::Socket | TransportKind::SslSocket => 3873,
            TransportKind::Bisocket | TransportKind::SslBisocket => 4457,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(
            self,
            TransportKind::SslSocket | TransportKind::Https | TransportKind::SslBisocket
        )
    }

    pub fn is_http(self) -> bool {
        matches!(self, TransportKind::Http | TransportKind::Https)
    }

    pub fn is_bisocket(self) -> bool {
        matches!(self, TransportKind::Bisocket | TransportKind::SslBisocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Immutable address of a remote endpoint plus its connection parameters.
#[derive(Debug, Clone)]
pub struct Locator {
    transport: TransportKind,
    host: String,
    port: u16,
    path: String,
    params: Vec<(String, String)>,
}

impl Locator {
    /// Builds a locator without parameters.
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            path: String::new(),
            params: Vec::new(),
        }
    }

    /// Parses a locator string.
    ///
    /// # Errors
    ///
    /// Returns [`RinvokeError::MalformedLocator`] when the scheme is missing or
    /// unknown, the host is empty, the port is not a valid `u16`, or a query
    /// pair has an empty key.
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &str| RinvokeError::MalformedLocator {
            locator: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri
            .trim()
            .split_once("://")
            .ok_or_else(|| malformed("missing '://' after scheme"))?;
        let transport = TransportKind::from_scheme(scheme)
            .ok_or_else(|| malformed(&format!("unknown transport '{}'", scheme)))?;

        let (before_query, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match before_query.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (before_query, ""),
        };

        let (host, port) = split_authority(authority).map_err(|reason| malformed(&reason))?;
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| malformed(&format!("invalid port '{}'", port)))?,
            None => transport.default_port(),
        };

        let mut params = Vec::new();
        if let Some(query) = query {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                if key.is_empty() {
                    return Err(malformed("query parameter with empty key"));
                }
                params.push((key.into_owned(), value.into_owned()));
            }
        }

        Ok(Self {
            transport,
            host: host.to_string(),
            port,
            path: path.trim_end_matches('/').to_string(),
            params,
        })
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path component without leading or trailing slashes (may be empty).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, bracketing IPv6 hosts, suitable for socket resolution.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// All parameters in insertion order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value for `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in insertion order.
    pub fn param_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value for `key` parsed as `T`; `None` if absent or unparsable.
    pub fn param_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.param(key).and_then(|v| v.trim().parse().ok())
    }

    /// Boolean parameter; `true`, `yes` and `1` are truthy.
    pub fn flag(&self, key: &str) -> bool {
        self.param(key)
            .map(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") || v == "1"
            })
            .unwrap_or(false)
    }

    /// Replaces the first value for `key`, or appends it.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    /// Drops every value for `key`.
    pub fn without_param(mut self, key: &str) -> Self {
        self.params.retain(|(k, _)| k != key);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_matches('/').to_string();
        self
    }

    /// Same transport, path and parameters bound to another address.
    pub fn with_address(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..self.clone()
        }
    }

    /// Candidate endpoints for multihome failover.
    ///
    /// The primary address comes first, followed by each `connectHomes` entry
    /// in order. An entry without a port inherits the primary port. The
    /// returned locators no longer carry `connectHomes`.
    pub fn homes(&self) -> Result<Vec<Locator>> {
        let base = self.clone().without_param(params::CONNECT_HOMES);
        let mut homes = vec![base.clone()];

        for list in self.param_values(params::CONNECT_HOMES) {
            for entry in list.split('!').map(str::trim).filter(|e| !e.is_empty()) {
                let (host, port) =
                    split_authority(entry).map_err(|reason| RinvokeError::MalformedLocator {
                        locator: self.to_string(),
                        reason: format!("bad connectHomes entry '{}': {}", entry, reason),
                    })?;
                let port = match port {
                    Some(port) => port.parse::<u16>().map_err(|_| {
                        RinvokeError::MalformedLocator {
                            locator: self.to_string(),
                            reason: format!("bad connectHomes port '{}'", port),
                        }
                    })?,
                    None => self.port,
                };
                let home = base.with_address(host, port);
                if !homes.contains(&home) {
                    homes.push(home);
                }
            }
        }

        Ok(homes)
    }

    /// Parameters sorted by key then value; the basis for equality and hashing.
    fn normalized_params(&self) -> Vec<(&str, &str)> {
        let mut sorted: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        sorted.sort_unstable();
        sorted
    }
}

/// Splits `host:port`, `[v6]:port`, `host` or `[v6]`.
fn split_authority(authority: &str) -> std::result::Result<(&str, Option<&str>), String> {
    if authority.is_empty() {
        return Err("missing host".to_string());
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 host".to_string())?;
        if host.is_empty() {
            return Err("missing host".to_string());
        }
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(port) if !port.is_empty() => Ok((host, Some(port))),
                _ => Err(format!("unexpected '{}' after IPv6 host", after)),
            },
        };
    }

    match authority.rsplit_once(':') {
        Some((host, _)) if host.is_empty() => Err("missing host".to_string()),
        Some((_, port)) if port.is_empty() => Err("missing port after ':'".to_string()),
        Some((host, _)) if host.contains(':') => {
            Err("IPv6 hosts must be bracketed".to_string())
        }
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((authority, None)),
    }
}

/// Percent-encodes everything a query component must not contain raw.
fn encode_component(value: &str, out: &mut String) {
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'~'
            | b'!'
            | b'*'
            | b'\''
            | b'('
            | b')'
            | b':'
            | b'/'
            | b','
            | b';'
            | b'@'
            | b'$' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/", self.transport.scheme(), self.address())?;
        if !self.path.is_empty() {
            f.write_str(&self.path)?;
        }
        if !self.params.is_empty() {
            let mut query = String::new();
            for (i, (key, value)) in self.params.iter().enumerate() {
                if i > 0 {
                    query.push('&');
                }
                encode_component(key, &mut query);
                query.push('=');
                encode_component(value, &mut query);
            }
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = RinvokeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport
            && self.host == other.host
            && self.port == other.port
            && self.path == other.path
            && self.normalized_params() == other.normalized_params()
    }
}

impl Eq for Locator {}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.path.hash(state);
        self.normalized_params().hash(state);
    }
}
