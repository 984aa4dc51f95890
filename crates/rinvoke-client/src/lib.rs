//! rinvoke client
//!
//! - **[`Client`]**: connect, invoke, oneway and callback listeners for one subsystem
//! - **[`ConnectionPool`]**: per-locator bounded pools with health checks and idle eviction
//! - **[`invoker`]**: per-transport client invokers and their state machine
//! - **[`callback`]**: listener table, poller and in-process callback server
//! - **[`LeasePinger`]**: keeps the server-side lease alive

pub mod callback;
pub mod client;
pub mod config;
pub mod invoker;
pub mod lease;
pub mod pool;

pub use callback::{CallbackHandler, CallbackPoller, CallbackServer, ListenerTable};
pub use client::{CallbackMode, Client};
pub use config::{BisocketConfig, CallbackConfig, LeaseConfig};
pub use invoker::{BisocketInvoker, ClientInvoker, InvokerState, PooledInvoker};
pub use lease::LeasePinger;
pub use pool::{ConnectionPool, Health, PoolConfig, PoolStats, PooledConnection};
