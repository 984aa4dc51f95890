//! Client leases.
//!
//! A client that pings with a `leasePeriod` holds a lease. Every ping renews
//! it. A lease left silent for twice its period expires, and the expiry is
//! reported to the connection listeners exactly once. A client that
//! disconnects cleanly terminates its lease without any notification.
//!
//! Clients announce their own period, so the sweeper runs at half the
//! shortest period currently held, never slower than its configured interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rinvoke_common::{ConnectionFailureEvent, ConnectionListeners};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Lease {
    period: Duration,
    renewed_at: Instant,
    endpoint: String,
}

impl Lease {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.renewed_at) > self.period * 2
    }
}

/// Shortest sweep interval, for very short announced periods.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

pub struct LeaseTracker {
    leases: Mutex<HashMap<String, Lease>>,
    listeners: ConnectionListeners,
    /// Wakes the sweeper when a lease with a new period arrives.
    rearm: Notify,
}

impl LeaseTracker {
    pub fn new(listeners: ConnectionListeners) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            listeners,
            rearm: Notify::new(),
        }
    }

    /// Starts or renews the lease of `client_id`.
    pub fn renew(&self, client_id: &str, period: Duration, endpoint: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let lease = Lease {
            period,
            renewed_at: Instant::now(),
            endpoint: endpoint.to_string(),
        };
        match leases.insert(client_id.to_string(), lease) {
            None => {
                tracing::debug!("Lease of client {} started ({:?})", client_id, period);
                self.rearm.notify_one();
            }
            Some(previous) if previous.period != period => self.rearm.notify_one(),
            Some(_) => {}
        }
    }

    /// Half the shortest active lease period, capped at `max`.
    pub fn sweep_interval(&self, max: Duration) -> Duration {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|lease| lease.period / 2)
            .fold(max, Duration::min)
            .max(MIN_SWEEP_INTERVAL)
    }

    /// Ends a lease without notifying anyone. Returns whether one existed.
    pub fn terminate(&self, client_id: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id)
            .is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(client_id)
    }

    pub fn listeners(&self) -> &ConnectionListeners {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired leases and notifies the listeners once per lease.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<(String, Lease)> = {
            let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = leases
                .iter()
                .filter(|(_, lease)| lease.expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| leases.remove(&id).map(|lease| (id, lease)))
                .collect()
        };

        for (client_id, lease) in &expired {
            tracing::warn!(
                "Lease of client {} expired (period {:?})",
                client_id,
                lease.period
            );
            self.listeners.notify(&ConnectionFailureEvent::new(
                client_id.as_str(),
                lease.endpoint.as_str(),
                format!("no ping within {}ms", lease.period.as_millis() * 2),
            ));
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Sweeps until `shutdown` flips, handing expired client ids to
    /// `on_expired`. `interval` is the slowest sweep rate; shorter leases
    /// speed it up (see [`sweep_interval`](Self::sweep_interval)).
    pub fn spawn<F>(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        on_expired: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            loop {
                let next = self.sweep_interval(interval);
                tokio::select! {
                    _ = tokio::time::sleep(next) => {
                        for client_id in self.sweep() {
                            on_expired(&client_id);
                        }
                    }
                    _ = self.rearm.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
