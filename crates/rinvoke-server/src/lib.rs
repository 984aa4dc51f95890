//! rinvoke server
//!
//! This crate hosts invocation handlers behind any rinvoke transport:
//!
//! - **[`Connector`]**: binds a locator and runs the listener lifecycle
//! - **[`Dispatcher`]**: routes requests to handlers on a bounded worker pool
//! - **[`CallbackManager`]**: push and pull callback delivery
//! - **[`LeaseTracker`]**: detects clients that stopped pinging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use rinvoke_server::{Connector, Invocation, InvocationHandler};
//! use rinvoke_common::{Payload, Result};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl InvocationHandler for Echo {
//!     async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
//!         Ok(invocation.request.payload)
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let mut connector = Connector::parse("socket://0.0.0.0:5400")?;
//! connector.add_invocation_handler("echo", Arc::new(Echo));
//! connector.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod lease;
pub mod registry;

pub use callback::{CallbackManager, CallbackStore, ListenerRegistration, PublishReport};
pub use config::ServerConfig;
pub use connector::{Connector, ConnectorState};
pub use dispatcher::Dispatcher;
pub use lease::LeaseTracker;
pub use registry::{CallbackPublisher, HandlerRegistry, Invocation, InvocationHandler};
