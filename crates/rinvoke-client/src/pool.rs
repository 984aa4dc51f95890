use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rinvoke_common::locator::{params, Locator};
use rinvoke_common::transport::{dialer_for, Channel, DialOptions, Dialer};
use rinvoke_common::{InvocationRequest, InvocationResponse, Result, RinvokeError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Default maximum number of pooled connections per locator.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
/// Default invocation timeout, also the longest a checkout waits for a free slot.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Default idle eviction threshold.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
/// Default retry budget for connection checks and connection establishment.
pub const DEFAULT_RETRIES: u32 = 3;

/// Health of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Never probed.
    Unchecked,
    /// Last probe or exchange succeeded.
    Healthy,
    /// Saw an error that leaves the connection unusable.
    Failed,
}

/// Connection pool configuration.
///
/// Every field is read from the locator by [`PoolConfig::from_locator`], so
/// two locators that differ in these parameters get separate pool keys with
/// their own settings.
///
/// # Fields
///
/// - `max_connections`: connections per locator, idle and in use together
/// - `acquire_timeout_ms`: how long checkout waits when the key is at capacity
/// - `idle_timeout`: idle connections older than this are evicted (`None` keeps them)
/// - `check_connection`: probe an idle connection before handing it out
/// - `retries`: probe failures tolerated, and connect attempts made, per checkout
///
/// # Default Configuration
///
/// - `max_connections`: 50
/// - `acquire_timeout_ms`: 60000
/// - `idle_timeout`: 60 seconds
/// - `check_connection`: false
/// - `retries`: 3
///
/// # Example
///
/// ```rust
/// use rinvoke_client::PoolConfig;
/// use rinvoke_common::Locator;
///
/// let locator: Locator = "socket://localhost:5400/?clientMaxPoolSize=2&socket.check_connection=true"
///     .parse()
///     .unwrap();
/// let config = PoolConfig::from_locator(&locator);
/// assert_eq!(config.max_connections, 2);
/// assert!(config.check_connection);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of connections per locator
    pub max_connections: usize,
    /// Maximum time to wait for a free slot in milliseconds
    pub acquire_timeout_ms: u64,
    /// Idle connections unused for this long are closed
    pub idle_timeout: Option<Duration>,
    /// Probe idle connections before reuse
    pub check_connection: bool,
    /// Probe failures tolerated and connect attempts made per checkout
    pub retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_ms: DEFAULT_TIMEOUT_MS,
            idle_timeout: Some(Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS)),
            check_connection: false,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl PoolConfig {
    pub fn from_locator(locator: &Locator) -> Self {
        let defaults = Self::default();
        Self {
            max_connections: locator
                .param_as::<usize>(params::CLIENT_MAX_POOL_SIZE)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            acquire_timeout_ms: locator
                .param_as::<u64>(params::TIMEOUT)
                .unwrap_or(defaults.acquire_timeout_ms),
            idle_timeout: match locator.param_as::<u64>(params::IDLE_TIMEOUT) {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.idle_timeout,
            },
            check_connection: locator.flag(params::CHECK_CONNECTION),
            retries: locator
                .param_as::<u32>(params::NUMBER_OF_CALL_RETRIES)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retries),
        }
    }
}

/// Snapshot of one pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct IdleConnection {
    channel: Box<dyn Channel>,
    created_at: Instant,
    last_used: Instant,
    health: Health,
}

impl IdleConnection {
    fn is_stale(&self, idle_timeout: Option<Duration>, now: Instant) -> bool {
        idle_timeout.is_some_and(|limit| now.duration_since(self.last_used) >= limit)
    }
}

/// Per-locator state. Checkout, checkin and eviction for one key are
/// serialized by `idle`; different keys never share a lock.
struct KeyPool {
    locator: Locator,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    slots: Arc<Semaphore>,
    idle: tokio::sync::Mutex<Vec<IdleConnection>>,
}

impl KeyPool {
    async fn connect(&self) -> Result<Box<dyn Channel>> {
        let attempts = self.config.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.dialer.dial(&self.locator).await {
                Ok(channel) => {
                    tracing::debug!("Pool created connection to {}", self.locator);
                    return Ok(channel);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.locator,
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e @ RinvokeError::CannotConnect { .. }) => Err(e),
            Some(e) => Err(RinvokeError::CannotConnect {
                locator: self.locator.to_string(),
                reason: e.to_string(),
            }),
            None => Err(RinvokeError::CannotConnect {
                locator: self.locator.to_string(),
                reason: "no connect attempt made".to_string(),
            }),
        }
    }
}

/// A connection checked out of the pool.
///
/// Holding one occupies a slot of its locator's key. Hand it back with
/// [`ConnectionPool::checkin`] or [`ConnectionPool::discard`]; dropping it
/// closes the connection and frees the slot.
pub struct PooledConnection {
    channel: Box<dyn Channel>,
    locator: Locator,
    created_at: Instant,
    last_used: Instant,
    health: Health,
    reused: bool,
    _slot: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Whether this connection came from the idle set rather than a fresh dial.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_open(&self) -> bool {
        self.health != Health::Failed && self.channel.is_open()
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_used = Instant::now();
        match &result {
            Ok(_) => self.health = Health::Healthy,
            Err(e) if e.is_connection_fatal() => self.health = Health::Failed,
            Err(_) => {}
        }
        result
    }

    pub async fn exchange(&mut self, request: &InvocationRequest) -> Result<InvocationResponse> {
        let result = self.channel.exchange(request).await;
        self.track(result)
    }

    pub async fn send_oneway(&mut self, request: &InvocationRequest) -> Result<()> {
        let result = self.channel.send_oneway(request).await;
        self.track(result)
    }

    pub async fn probe(&mut self) -> Result<()> {
        let result = self.channel.probe().await;
        self.track(result)
    }
}

/// Connection pool keyed by locator.
///
/// # Architecture
///
/// - Each distinct locator gets its own key with its own [`PoolConfig`]
/// - A semaphore per key bounds connections in use to `max_connections`
/// - Idle connections are reused LIFO; stale ones are skipped and closed
/// - With `socket.check_connection`, an idle connection is probed before
///   reuse; a probe that fails or gets no answer within the timeout discards
///   it and tries the next one, up to the
///   retry budget, after which a fresh connection is dialed
/// - A fresh dial is retried up to the budget before failing with
///   `CannotConnect`
///
/// # Thread Safety
///
/// The key map sits behind a short-lived std mutex that is never held across
/// an await. Work on one key is serialized by that key's own async mutex, so
/// traffic to different locators never contends.
///
/// # Example
///
/// ```rust,no_run
/// use rinvoke_client::ConnectionPool;
/// use rinvoke_common::{InvocationRequest, Locator};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::default();
/// let locator: Locator = "socket://127.0.0.1:5400".parse()?;
///
/// let mut conn = pool.checkout(&locator).await?;
/// let response = conn.exchange(&InvocationRequest::invoke("test", json!("foo"))).await?;
/// pool.checkin(conn).await;
/// # let _ = response;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    options: DialOptions,
    keys: Mutex<HashMap<Locator, Arc<KeyPool>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DialOptions::default())
    }
}

impl ConnectionPool {
    pub fn new(options: DialOptions) -> Self {
        Self {
            options,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn dial_options(&self) -> &DialOptions {
        &self.options
    }

    fn key(&self, locator: &Locator) -> Result<Arc<KeyPool>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = keys.get(locator) {
            return Ok(key.clone());
        }

        let config = PoolConfig::from_locator(locator);
        let key = Arc::new(KeyPool {
            locator: locator.clone(),
            dialer: dialer_for(locator, self.options.clone())?,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            idle: tokio::sync::Mutex::new(Vec::new()),
            config,
        });
        keys.insert(locator.clone(), key.clone());
        Ok(key)
    }

    fn existing_key(&self, locator: &Locator) -> Option<Arc<KeyPool>> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(locator)
            .cloned()
    }

    /// Checks out a connection to `locator`.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` if every slot stays in use for `acquire_timeout_ms`
    /// - `CannotConnect` if a fresh connection is needed and cannot be made
    /// - `Tls` if the locator needs TLS and the pool has no TLS context
    pub async fn checkout(&self, locator: &Locator) -> Result<PooledConnection> {
        let key = self.key(locator)?;
        let waited = Instant::now();
        let wait = Duration::from_millis(key.config.acquire_timeout_ms);

        let slot = match tokio::time::timeout(wait, key.slots.clone().acquire_owned()).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => {
                return Err(RinvokeError::InvalidState(format!(
                    "pool for {} is closed",
                    locator
                )))
            }
            Err(_) => {
                return Err(RinvokeError::PoolExhausted {
                    locator: locator.to_string(),
                    waited_ms: waited.elapsed().as_millis() as u64,
                })
            }
        };

        let mut failed_probes = 0;
        loop {
            if key.config.check_connection && failed_probes >= key.config.retries {
                break;
            }
            let Some(idle) = key.idle.lock().await.pop() else {
                break;
            };
            let stale = idle.is_stale(key.config.idle_timeout, Instant::now());
            let IdleConnection {
                mut channel,
                created_at,
                last_used,
                health,
            } = idle;
            if stale || !channel.is_open() {
                channel.close().await;
                continue;
            }
            if !key.config.check_connection {
                return Ok(PooledConnection {
                    channel,
                    locator: key.locator.clone(),
                    created_at,
                    last_used,
                    health,
                    reused: true,
                    _slot: slot,
                });
            }
            let probe = tokio::time::timeout(wait, channel.probe()).await.unwrap_or_else(|_| {
                Err(RinvokeError::InvocationTimeout(key.config.acquire_timeout_ms))
            });
            match probe {
                Ok(()) => {
                    return Ok(PooledConnection {
                        channel,
                        locator: key.locator.clone(),
                        created_at,
                        last_used: Instant::now(),
                        health: Health::Healthy,
                        reused: true,
                        _slot: slot,
                    })
                }
                Err(e) => {
                    failed_probes += 1;
                    tracing::debug!(
                        "Discarding pooled connection to {} after failed check: {}",
                        key.locator,
                        e
                    );
                    channel.close().await;
                }
            }
        }

        let channel = key.connect().await?;
        let now = Instant::now();
        Ok(PooledConnection {
            channel,
            locator: key.locator.clone(),
            created_at: now,
            last_used: now,
            health: Health::Unchecked,
            reused: false,
            _slot: slot,
        })
    }

    /// Returns a connection for reuse. Failed or closed connections are
    /// closed instead.
    pub async fn checkin(&self, conn: PooledConnection) {
        if !conn.is_open() {
            self.discard(conn).await;
            return;
        }
        let Some(key) = self.existing_key(&conn.locator) else {
            self.discard(conn).await;
            return;
        };

        let PooledConnection {
            channel,
            created_at,
            health,
            _slot,
            ..
        } = conn;
        key.idle.lock().await.push(IdleConnection {
            channel,
            created_at,
            last_used: Instant::now(),
            health,
        });
        // The slot is released only once the connection is idle again
        drop(_slot);
    }

    /// Closes a connection and frees its slot.
    pub async fn discard(&self, conn: PooledConnection) {
        tracing::debug!("Discarding connection to {}", conn.locator);
        let PooledConnection { mut channel, _slot, .. } = conn;
        channel.close().await;
    }

    /// Closes idle connections unused for longer than their key's idle timeout.
    /// Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let keys: Vec<_> = self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let now = Instant::now();
        let mut evicted = Vec::new();
        for key in keys {
            let mut idle = key.idle.lock().await;
            let (stale, fresh): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|c| c.is_stale(key.config.idle_timeout, now) || !c.channel.is_open());
            *idle = fresh;
            if !stale.is_empty() {
                tracing::debug!("Evicting {} idle connections to {}", stale.len(), key.locator);
            }
            evicted.extend(stale);
        }

        let count = evicted.len();
        for mut conn in evicted {
            conn.channel.close().await;
        }
        count
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `interval` until the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_idle().await;
            }
        })
    }

    pub async fn stats(&self, locator: &Locator) -> PoolStats {
        let Some(key) = self.existing_key(locator) else {
            return PoolStats::default();
        };
        let idle = key.idle.lock().await.len();
        PoolStats {
            idle,
            in_use: key.config.max_connections - key.slots.available_permits(),
            max: key.config.max_connections,
        }
    }

    /// Drops the key for `locator`, closing its idle connections. Connections
    /// still checked out are closed when they come back.
    pub async fn drain(&self, locator: &Locator) {
        let key = self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(locator);
        if let Some(key) = key {
            let idle: Vec<_> = key.idle.lock().await.drain(..).collect();
            for mut conn in idle {
                conn.channel.close().await;
            }
            tracing::debug!("Drained pool for {}", locator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn locator(raw: &str) -> Locator {
        raw.parse().unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.acquire_timeout_ms, 60000);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert!(!config.check_connection);
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_config_from_locator() {
        let config = PoolConfig::from_locator(&locator(
            "socket://h:1/?clientMaxPoolSize=5&timeout=250&idleTimeout=0&socket.check_connection=true&numberOfCallRetries=1",
        ));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout_ms, 250);
        assert_eq!(config.idle_timeout, None);
        assert!(config.check_connection);
        assert_eq!(config.retries, 1);
    }

    #[tokio::test]
    async fn test_checkout_unreachable_is_cannot_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::default();
        let target = locator(&format!("socket://127.0.0.1:{}/?timeout=500&numberOfCallRetries=2", port));
        assert!(matches!(
            pool.checkout(&target).await,
            Err(RinvokeError::CannotConnect { .. })
        ));
        assert_eq!(pool.stats(&target).await.in_use, 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_all_slots_busy() {
        // A bare TCP listener is enough: checkout only dials
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let pool = ConnectionPool::default();
        let target = locator(&format!("socket://127.0.0.1:{}/?clientMaxPoolSize=1&timeout=100", port));
        let first = pool.checkout(&target).await.unwrap();
        assert_eq!(pool.stats(&target).await.in_use, 1);

        match pool.checkout(&target).await {
            Err(RinvokeError::PoolExhausted { waited_ms, .. }) => assert!(waited_ms >= 100),
            Err(other) => panic!("expected PoolExhausted, got {:?}", other),
            Ok(_) => panic!("expected PoolExhausted, got a connection"),
        }

        pool.checkin(first).await;
        let stats = pool.stats(&target).await;
        assert_eq!((stats.idle, stats.in_use), (1, 0));

        let reused = pool.checkout(&target).await.unwrap();
        assert!(reused.is_reused());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_connection_gives_up_on_silent_peer() {
        // Accepts and holds connections but never answers a ping
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let pool = ConnectionPool::default();
        let target = locator(&format!(
            "socket://127.0.0.1:{}/?socket.check_connection=true&timeout=200",
            port
        ));
        let conn = pool.checkout(&target).await.unwrap();
        pool.checkin(conn).await;

        let started = Instant::now();
        let conn = tokio::time::timeout(Duration::from_secs(3), pool.checkout(&target))
            .await
            .expect("checkout hung on an unanswered probe")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!conn.is_reused());
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_connections_are_evicted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let pool = ConnectionPool::default();
        let target = locator(&format!("socket://127.0.0.1:{}/?idleTimeout=20", port));
        let conn = pool.checkout(&target).await.unwrap();
        pool.checkin(conn).await;
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.stats(&target).await.idle, 0);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let pool = ConnectionPool::default();
        let target = locator(&format!("socket://127.0.0.1:{}/?clientMaxPoolSize=1", port));
        let conn = pool.checkout(&target).await.unwrap();
        pool.discard(conn).await;
        let stats = pool.stats(&target).await;
        assert_eq!((stats.idle, stats.in_use), (0, 0));

        pool.drain(&target).await;
        assert_eq!(pool.stats(&target).await, PoolStats::default());
    }
}
