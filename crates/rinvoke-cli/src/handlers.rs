//! Handlers hosted by `rinvoke serve`.

use async_trait::async_trait;
use rinvoke_common::{Payload, Result};
use rinvoke_server::{Invocation, InvocationHandler};
use serde_json::json;

/// Subsystem name of [`EchoHandler`].
pub const ECHO: &str = "echo";
/// Subsystem name of [`EventsHandler`].
pub const EVENTS: &str = "events";

/// Returns the payload it was given.
pub struct EchoHandler;

#[async_trait]
impl InvocationHandler for EchoHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        tracing::debug!("echo from client {}", invocation.client_id());
        Ok(invocation.request.payload)
    }
}

/// Publishes every payload it receives to the listeners of its subsystem
/// and answers with the delivery counts.
pub struct EventsHandler;

#[async_trait]
impl InvocationHandler for EventsHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        let report = invocation
            .callbacks
            .publish(invocation.request.payload.clone())
            .await;
        tracing::info!(
            "Published event to {} ({} pushed, {} stored, {} failed)",
            invocation.callbacks.subsystem(),
            report.pushed,
            report.stored,
            report.failed
        );
        Ok(json!({
            "pushed": report.pushed,
            "stored": report.stored,
            "failed": report.failed,
        }))
    }
}
