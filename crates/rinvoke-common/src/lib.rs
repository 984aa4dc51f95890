//! rinvoke common types and transports
//!
//! This crate holds everything the client and the server share:
//!
//! - **[`locator`]**: endpoint addresses and their connection parameters
//! - **[`protocol`]**: invocation requests, responses, callbacks and the error taxonomy
//! - **[`marshal`]**: pluggable request/response encodings and their registry
//! - **[`transport`]**: socket, TLS socket, bisocket and HTTP(S) transports
//! - **[`listener`]**: connection failure notification
//!
//! # Example
//!
//! ```
//! use rinvoke_common::{InvocationRequest, InvocationResponse, Locator};
//! use serde_json::json;
//!
//! let locator: Locator = "socket://localhost:5400/?timeout=5000".parse().unwrap();
//! let request = InvocationRequest::invoke("test", json!("foo")).with_timeout(5000);
//! let response = InvocationResponse::success(request.id, json!("bar"));
//! assert_eq!(response.into_result().unwrap(), json!("bar"));
//! # let _ = locator;
//! ```

pub mod listener;
pub mod locator;
pub mod marshal;
pub mod protocol;
pub mod transport;

pub use listener::{ConnectionFailureEvent, ConnectionListener, ConnectionListeners};
pub use locator::{Locator, TransportKind};
pub use protocol::*;
