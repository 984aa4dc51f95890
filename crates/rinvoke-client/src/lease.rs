//! Client heartbeat.
//!
//! A [`LeasePinger`] sends a `Ping` carrying the lease period every period,
//! starting immediately so the server opens the lease at connect time. The
//! first failed ping of a failure streak notifies the connection listeners;
//! a later successful ping ends the streak.
//!
//! Pings go through [`ClientInvoker::heartbeat`], which for pooled invokers
//! uses a connection of its own, so a saturated pool cannot starve the lease.

use std::sync::Arc;

use rinvoke_common::protocol::metadata;
use rinvoke_common::{
    ConnectionFailureEvent, ConnectionListeners, InvocationKind, InvocationRequest,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::LeaseConfig;
use crate::invoker::{ClientInvoker, InvokerState};

pub struct LeasePinger {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LeasePinger {
    pub fn spawn(
        invoker: Arc<dyn ClientInvoker>,
        config: LeaseConfig,
        client_id: impl Into<String>,
        listeners: ConnectionListeners,
    ) -> Self {
        let client_id = client_id.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let period_ms = config.period.as_millis() as u64;
            let mut ticker = tokio::time::interval(config.period);
            let mut failing = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let ping = InvocationRequest::control(InvocationKind::Ping)
                    .with_client_id(client_id.clone())
                    .with_meta(metadata::LEASE_PERIOD, period_ms)
                    .with_timeout(period_ms);
                match invoker.heartbeat(ping).await {
                    Ok(_) => {
                        if failing {
                            tracing::info!("Lease ping to {} recovered", invoker.locator());
                        }
                        failing = false;
                    }
                    Err(e) if !failing => {
                        failing = true;
                        tracing::warn!("Lease ping to {} failed: {}", invoker.locator(), e);
                        // A failed invoker has already reported itself
                        if invoker.state() == InvokerState::Failed {
                            continue;
                        }
                        listeners.notify(&ConnectionFailureEvent::new(
                            &client_id,
                            invoker.locator().to_string(),
                            format!("lease ping failed: {}", e),
                        ));
                    }
                    Err(e) => tracing::debug!("Lease ping to {} still failing: {}", invoker.locator(), e),
                }
            }
        });

        Self { shutdown, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
