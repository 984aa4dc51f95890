//! Server side of the callback subsystem.
//!
//! Listeners register per subsystem. Publishing a payload fans it out to
//! every listener of that subsystem, choosing a route per listener:
//!
//! - **Reverse**: the registration named a `callbackLocator`, so the server
//!   dials the client's own callback server and sends it a oneway `Callback`
//! - **Control**: the client holds an open bisocket control channel
//! - **Pull**: otherwise the callback lands in the client's [`CallbackStore`]
//!   until the client polls
//!
//! A failed delivery is logged and reported to the connection listeners; it
//! never stops the fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use rinvoke_common::protocol::metadata;
use rinvoke_common::transport::{dialer_for, Channel, ControlChannel, DialOptions, Dialer};
use rinvoke_common::{
    Callback, ConnectionFailureEvent, ConnectionListeners, InvocationKind, InvocationRequest,
    Locator, Metadata, Payload, Result, RinvokeError,
};

/// Bounded FIFO of undelivered callbacks for one client.
///
/// When full, the oldest callback is evicted to make room.
#[derive(Debug)]
pub struct CallbackStore {
    capacity: usize,
    queue: Mutex<VecDeque<Callback>>,
}

impl CallbackStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a callback. Returns the evicted one, if the store was full.
    pub fn push(&self, callback: Callback) -> Option<Callback> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(callback);
        evicted
    }

    /// Removes and returns everything queued, oldest first.
    pub fn drain(&self) -> Vec<Callback> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pushes callbacks to a client-hosted callback server.
pub struct ReverseConnector {
    locator: Locator,
    dialer: Arc<dyn Dialer>,
    channel: tokio::sync::Mutex<Option<Box<dyn Channel>>>,
}

impl ReverseConnector {
    pub fn new(locator: Locator, options: DialOptions) -> Result<Self> {
        let dialer = dialer_for(&locator, options)?;
        Ok(Self {
            locator,
            dialer,
            channel: tokio::sync::Mutex::new(None),
        })
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub async fn deliver(&self, callback: &Callback) -> Result<()> {
        let request = InvocationRequest::new(
            callback.subsystem.clone(),
            InvocationKind::Callback,
            serde_json::to_value(callback)?,
        );

        let mut slot = self.channel.lock().await;
        let reuse = matches!(slot.as_ref(), Some(channel) if channel.is_open());
        if !reuse {
            *slot = Some(self.dialer.dial(&self.locator).await?);
        }
        let Some(channel) = slot.as_mut() else {
            return Err(RinvokeError::InvalidState("reverse channel missing".to_string()));
        };

        let result = channel.send_oneway(&request).await;
        if result.is_err() {
            if let Some(mut channel) = slot.take() {
                channel.close().await;
            }
        }
        result
    }

    pub async fn close(&self) {
        if let Some(mut channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
    }
}

enum Route {
    Reverse(ReverseConnector),
    /// Control channel when one is open, the pull store otherwise.
    Client,
}

/// One client-side listener registered for a subsystem.
pub struct ListenerRegistration {
    pub client_id: String,
    pub listener_id: String,
    pub subsystem: String,
    pub metadata: Metadata,
    route: Route,
}

impl ListenerRegistration {
    /// Locator of the client's reverse callback server, if push goes there.
    pub fn callback_locator(&self) -> Option<&Locator> {
        match &self.route {
            Route::Reverse(connector) => Some(connector.locator()),
            Route::Client => None,
        }
    }
}

/// Outcome of one publish fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Pushed over a control channel or reverse connector.
    pub pushed: usize,
    /// Queued in a pull store.
    pub stored: usize,
    pub failed: usize,
}

enum Delivery {
    Pushed,
    Stored,
}

pub struct CallbackManager {
    listeners: RwLock<HashMap<String, Vec<Arc<ListenerRegistration>>>>,
    stores: Mutex<HashMap<String, Arc<CallbackStore>>>,
    controls: Mutex<HashMap<String, ControlChannel>>,
    store_capacity: usize,
    dial_options: DialOptions,
    connection_listeners: ConnectionListeners,
}

impl CallbackManager {
    pub fn new(
        store_capacity: usize,
        dial_options: DialOptions,
        connection_listeners: ConnectionListeners,
    ) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            store_capacity,
            dial_options,
            connection_listeners,
        }
    }

    /// Registers a listener, replacing any earlier one with the same ids.
    ///
    /// # Errors
    ///
    /// - `MalformedLocator` if `callbackLocator` metadata does not parse
    /// - `Tls` if it names a TLS transport and no TLS context is configured
    pub fn add_listener(
        &self,
        client_id: &str,
        listener_id: &str,
        subsystem: &str,
        metadata: Metadata,
    ) -> Result<Arc<ListenerRegistration>> {
        let route = match metadata.get(metadata::CALLBACK_LOCATOR) {
            Some(raw) => {
                let locator = Locator::parse(raw)?;
                Route::Reverse(ReverseConnector::new(locator, self.dial_options.clone())?)
            }
            None => Route::Client,
        };

        let registration = Arc::new(ListenerRegistration {
            client_id: client_id.to_string(),
            listener_id: listener_id.to_string(),
            subsystem: subsystem.to_string(),
            metadata,
            route,
        });

        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let entries = listeners.entry(subsystem.to_string()).or_default();
        entries.retain(|r| !(r.client_id == client_id && r.listener_id == listener_id));
        entries.push(registration.clone());

        tracing::debug!(
            "Listener {} of client {} registered for {}",
            listener_id,
            client_id,
            subsystem
        );
        Ok(registration)
    }

    pub fn remove_listener(&self, client_id: &str, listener_id: &str) -> Option<Arc<ListenerRegistration>> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = None;
        for entries in listeners.values_mut() {
            if let Some(pos) = entries
                .iter()
                .position(|r| r.client_id == client_id && r.listener_id == listener_id)
            {
                removed = Some(entries.remove(pos));
                break;
            }
        }
        listeners.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Forgets everything known about a client. Returns its registrations.
    pub fn drop_client(&self, client_id: &str) -> Vec<Arc<ListenerRegistration>> {
        let mut removed = Vec::new();
        {
            let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            for entries in listeners.values_mut() {
                entries.retain(|r| {
                    if r.client_id == client_id {
                        removed.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            listeners.retain(|_, entries| !entries.is_empty());
        }
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        removed
    }

    pub fn listener_count(&self, subsystem: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(subsystem)
            .map_or(0, Vec::len)
    }

    pub fn open_control(&self, channel: ControlChannel) {
        let client_id = channel.client_id().to_string();
        let previous = self
            .controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.clone(), channel);
        if previous.is_some() {
            tracing::debug!("Control channel of client {} replaced", client_id);
        }
    }

    /// Forgets a control channel unless a newer connection already replaced it.
    pub fn close_control(&self, client_id: &str, connection_id: u64) {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        if controls
            .get(client_id)
            .is_some_and(|c| c.connection_id() == connection_id)
        {
            controls.remove(client_id);
        }
    }

    pub fn has_control(&self, client_id: &str) -> bool {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .is_some_and(|c| !c.is_closed())
    }

    fn store_for(&self, client_id: &str) -> Arc<CallbackStore> {
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(CallbackStore::new(self.store_capacity)))
            .clone()
    }

    /// Queues a callback for `client_id` to pick up on its next poll.
    pub fn enqueue(&self, client_id: &str, callback: Callback) {
        if let Some(evicted) = self.store_for(client_id).push(callback) {
            tracing::warn!(
                "Callback store of client {} full, evicted callback from {}",
                client_id,
                evicted.timestamp_ms
            );
        }
    }

    /// Drains the client's store. Never blocks; empty if nothing is pending.
    pub fn poll(&self, client_id: &str) -> Vec<Callback> {
        let store = self
            .stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .cloned();
        store.map(|s| s.drain()).unwrap_or_default()
    }

    pub fn pending(&self, client_id: &str) -> usize {
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .map_or(0, |s| s.len())
    }

    /// Fans `payload` out to every listener of `subsystem`.
    pub async fn publish(&self, subsystem: &str, payload: Payload) -> PublishReport {
        let registrations: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(subsystem)
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for registration in registrations {
            let callback = Callback::new(&registration.listener_id, subsystem, payload.clone());
            match self.deliver(&registration, callback).await {
                Ok(Delivery::Pushed) => report.pushed += 1,
                Ok(Delivery::Stored) => report.stored += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Callback delivery to listener {} of client {} failed: {}",
                        registration.listener_id,
                        registration.client_id,
                        e
                    );
                    let endpoint = registration
                        .callback_locator()
                        .map(Locator::to_string)
                        .unwrap_or_else(|| "control channel".to_string());
                    self.connection_listeners.notify(&ConnectionFailureEvent::new(
                        &registration.client_id,
                        endpoint,
                        format!("callback delivery failed: {}", e),
                    ));
                }
            }
        }
        report
    }

    async fn deliver(&self, registration: &ListenerRegistration, callback: Callback) -> Result<Delivery> {
        match &registration.route {
            Route::Reverse(connector) => {
                connector.deliver(&callback).await?;
                Ok(Delivery::Pushed)
            }
            Route::Client => {
                let control = self
                    .controls
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&registration.client_id)
                    .cloned();
                match control {
                    Some(control) => {
                        control.push(callback).await?;
                        Ok(Delivery::Pushed)
                    }
                    None => {
                        self.enqueue(&registration.client_id, callback);
                        Ok(Delivery::Stored)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> CallbackManager {
        CallbackManager::new(3, DialOptions::default(), ConnectionListeners::new())
    }

    #[test]
    fn test_store_evicts_oldest_first() {
        let store = CallbackStore::new(2);
        for i in 0..3 {
            store.push(Callback::new("l", "s", json!(i)));
        }
        let drained: Vec<_> = store.drain().into_iter().map(|c| c.payload).collect();
        assert_eq!(drained, vec![json!(1), json!(2)]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_poll_drains_then_returns_empty() {
        let manager = manager();
        manager.enqueue("client-x", Callback::new("l", "events", json!("event-1")));

        let first: Vec<_> = manager.poll("client-x").into_iter().map(|c| c.payload).collect();
        assert_eq!(first, vec![json!("event-1")]);
        assert!(manager.poll("client-x").is_empty());
        assert!(manager.poll("never-seen").is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_control_goes_to_store() {
        let manager = manager();
        manager
            .add_listener("c1", "l1", "events", Metadata::new())
            .unwrap();
        manager
            .add_listener("c2", "l2", "events", Metadata::new())
            .unwrap();

        let report = manager.publish("events", json!("tick")).await;
        assert_eq!(report, PublishReport { pushed: 0, stored: 2, failed: 0 });
        assert_eq!(manager.pending("c1"), 1);
        assert_eq!(manager.poll("c2")[0].listener_id, "l2");
    }

    #[tokio::test]
    async fn test_publish_prefers_open_control_channel() {
        let manager = manager();
        manager.add_listener("c1", "l1", "events", Metadata::new()).unwrap();
        let (channel, mut rx) = ControlChannel::new("c1", 1);
        manager.open_control(channel);

        let report = manager.publish("events", json!("tick")).await;
        assert_eq!(report.pushed, 1);
        assert_eq!(rx.recv().await.unwrap().payload, json!("tick"));
        assert_eq!(manager.pending("c1"), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported_and_fan_out_continues() {
        let failures = Arc::new(AtomicUsize::new(0));
        let listeners = ConnectionListeners::new();
        let hits = failures.clone();
        listeners.add(Arc::new(move |_: &ConnectionFailureEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        let manager = CallbackManager::new(10, DialOptions::default(), listeners);

        manager.add_listener("dead", "l1", "events", Metadata::new()).unwrap();
        manager.add_listener("alive", "l2", "events", Metadata::new()).unwrap();
        let (channel, rx) = ControlChannel::new("dead", 1);
        manager.open_control(channel);
        drop(rx);

        let report = manager.publish("events", json!(1)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_control_ignores_stale_connection() {
        let manager = manager();
        let (old, _old_rx) = ControlChannel::new("c1", 1);
        let (new, _new_rx) = ControlChannel::new("c1", 2);
        manager.open_control(old);
        manager.open_control(new);

        manager.close_control("c1", 1);
        assert!(manager.has_control("c1"));
        manager.close_control("c1", 2);
        assert!(!manager.has_control("c1"));
    }

    #[test]
    fn test_remove_and_drop_client() {
        let manager = manager();
        manager.add_listener("c1", "l1", "a", Metadata::new()).unwrap();
        manager.add_listener("c1", "l2", "b", Metadata::new()).unwrap();
        manager.add_listener("c2", "l3", "a", Metadata::new()).unwrap();

        assert!(manager.remove_listener("c1", "l1").is_some());
        assert!(manager.remove_listener("c1", "l1").is_none());
        assert_eq!(manager.listener_count("a"), 1);

        manager.enqueue("c1", Callback::new("l2", "b", json!(0)));
        let dropped = manager.drop_client("c1");
        assert_eq!(dropped.len(), 1);
        assert_eq!(manager.listener_count("b"), 0);
        assert_eq!(manager.pending("c1"), 0);
    }

    #[test]
    fn test_bad_callback_locator_is_rejected() {
        let manager = manager();
        let mut metadata = Metadata::new();
        metadata.insert(metadata::CALLBACK_LOCATOR.to_string(), "nope".to_string());
        assert!(matches!(
            manager.add_listener("c1", "l1", "events", metadata),
            Err(RinvokeError::MalformedLocator { .. })
        ));
    }
}
