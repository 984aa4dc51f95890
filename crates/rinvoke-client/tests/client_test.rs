// End-to-end tests for rinvoke-client
//
// Every test runs a real rinvoke-server connector on an ephemeral port and
// drives it through the public Client API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rinvoke_client::{CallbackHandler, Client, InvokerState};
use rinvoke_common::transport::TlsContext;
use rinvoke_common::{
    Callback, ConnectionFailureEvent, Locator, Metadata, Payload, Result, RinvokeError,
};
use rinvoke_server::{Connector, Invocation, InvocationHandler};
use serde_json::json;

// ============================================================================
// Test Helpers
// ============================================================================

/// Answers "foo" with "bar", sleeps on "slow", records oneway payloads.
#[derive(Default)]
struct TestHandler {
    oneways: Mutex<Vec<Payload>>,
}

#[async_trait]
impl InvocationHandler for TestHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        if invocation.request.kind == rinvoke_common::InvocationKind::Oneway {
            self.oneways
                .lock()
                .unwrap()
                .push(invocation.payload().clone());
            return Ok(Payload::Null);
        }
        match invocation.payload() {
            Payload::String(s) if s == "foo" => Ok(json!("bar")),
            Payload::String(s) if s == "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("done"))
            }
            other => Ok(other.clone()),
        }
    }
}

async fn start_connector(locator: &str) -> (Connector, Arc<TestHandler>) {
    let handler = Arc::new(TestHandler::default());
    let mut connector = Connector::parse(locator).unwrap();
    connector.add_invocation_handler("test", handler.clone());
    connector.start().await.unwrap();
    (connector, handler)
}

/// A client for the connector's bound address, without the server's own params.
fn client_for(connector: &Connector, params: &[(&str, &str)]) -> Client {
    let bound = connector.locator();
    let mut locator = Locator::new(bound.transport(), bound.host(), bound.port());
    for (key, value) in params {
        locator = locator.with_param(*key, *value);
    }
    Client::new(locator, "test")
}

fn recorder() -> (Arc<dyn CallbackHandler>, Arc<Mutex<Vec<Callback>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Arc<dyn CallbackHandler> = Arc::new(move |callback: &Callback| {
        sink.lock().unwrap().push(callback.clone());
    });
    (handler, seen)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn failure_counter() -> (Arc<AtomicUsize>, Arc<dyn rinvoke_common::ConnectionListener>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let listener: Arc<dyn rinvoke_common::ConnectionListener> =
        Arc::new(move |_: &ConnectionFailureEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    (count, listener)
}

// ============================================================================
// Invocation
// ============================================================================

#[tokio::test]
async fn test_foo_returns_bar_on_every_transport() {
    for scheme in ["socket", "bisocket", "http"] {
        let (connector, _) = start_connector(&format!("{}://127.0.0.1:0", scheme)).await;
        let client = client_for(&connector, &[]);
        client.connect().await.unwrap();
        assert_eq!(client.state().await, InvokerState::Connected);

        let reply = client.invoke(json!("foo"), Metadata::new()).await.unwrap();
        assert_eq!(reply, json!("bar"), "{}", scheme);
        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, InvokerState::Unconnected);
    }
}

#[tokio::test]
async fn test_postcard_serialization() {
    let (connector, _) = start_connector("socket://127.0.0.1:0").await;
    let client = client_for(&connector, &[("serializationtype", "postcard")]);
    client.connect().await.unwrap();
    let reply = client
        .invoke(json!({"nested": [1, 2, 3]}), Metadata::new())
        .await
        .unwrap();
    assert_eq!(reply, json!({"nested": [1, 2, 3]}));
}

#[tokio::test]
async fn test_tls_socket_round_trip() {
    let server_tls = TlsContext::self_signed(vec!["localhost".to_string()]).unwrap();
    let client_tls = server_tls.clone().with_server_name("localhost");

    let handler = Arc::new(TestHandler::default());
    let mut connector = Connector::parse("sslsocket://127.0.0.1:0")
        .unwrap()
        .with_tls(server_tls);
    connector.add_invocation_handler("test", handler);
    connector.start().await.unwrap();

    let client = client_for(&connector, &[]).with_tls(client_tls);
    client.connect().await.unwrap();
    assert_eq!(
        client.invoke(json!("foo"), Metadata::new()).await.unwrap(),
        json!("bar")
    );
}

#[tokio::test]
async fn test_unreachable_locator_is_cannot_connect() {
    let client =
        Client::parse("socket://127.0.0.1:1/?timeout=200&numberOfCallRetries=2", "test").unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, RinvokeError::CannotConnect { .. }), "{:?}", err);
    assert_eq!(client.state().await, InvokerState::Unconnected);
}

#[tokio::test]
async fn test_connect_homes_fail_over() {
    let (connector, _) = start_connector("socket://127.0.0.1:0").await;
    let live = connector.locator().port();
    let uri = format!(
        "socket://127.0.0.1:1/?timeout=200&numberOfCallRetries=1&connectHomes=127.0.0.1:{}",
        live
    );
    let client = Client::parse(&uri, "test").unwrap();
    client.connect().await.unwrap();

    assert_eq!(client.connected_locator().await.unwrap().port(), live);
    assert_eq!(
        client.invoke(json!("foo"), Metadata::new()).await.unwrap(),
        json!("bar")
    );
}

#[tokio::test]
async fn test_removed_handler_is_no_such_handler() {
    let (connector, _) = start_connector("socket://127.0.0.1:0").await;
    let client = client_for(&connector, &[]);
    client.connect().await.unwrap();
    assert_eq!(
        client.invoke(json!("foo"), Metadata::new()).await.unwrap(),
        json!("bar")
    );

    connector.remove_invocation_handler("test");
    let err = client.invoke(json!("foo"), Metadata::new()).await.unwrap_err();
    assert!(matches!(err, RinvokeError::NoSuchHandler(_)), "{:?}", err);

    // A remote failure leaves the client usable
    assert_eq!(client.state().await, InvokerState::Connected);
}

#[tokio::test]
async fn test_metadata_timeout_abandons_wait() {
    let (connector, _) = start_connector("socket://127.0.0.1:0").await;
    let client = client_for(&connector, &[]);
    client.connect().await.unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("timeout".to_string(), "50".to_string());
    let err = client.invoke(json!("slow"), metadata).await.unwrap_err();
    assert!(matches!(err, RinvokeError::InvocationTimeout(50)), "{:?}", err);

    assert_eq!(
        client.invoke(json!("foo"), Metadata::new()).await.unwrap(),
        json!("bar")
    );
}

#[tokio::test]
async fn test_checked_connection_to_silent_peer_times_out() {
    // Accepts connections but never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let uri = format!(
        "socket://127.0.0.1:{}/?socket.check_connection=true&timeout=5000",
        port
    );
    let client = Client::parse(&uri, "test").unwrap();
    client.connect().await.unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("timeout".to_string(), "100".to_string());
    let started = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(2), client.invoke(json!("foo"), metadata))
        .await
        .expect("invoke outlived its timeout")
        .unwrap_err();
    assert!(matches!(err, RinvokeError::InvocationTimeout(100)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_server_pool_of_one_serializes_concurrent_calls() {
    let (connector, _) = start_connector("socket://127.0.0.1:0/?maxPoolSize=1").await;
    let client = Arc::new(client_for(&connector, &[]));
    client.connect().await.unwrap();

    let started = Instant::now();
    let calls = (0..2).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.invoke(json!("slow"), Metadata::new()).await })
    });
    for result in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap().unwrap(), json!("done"));
    }
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_in_use_connections_never_exceed_pool_size() {
    let (connector, _) = start_connector("socket://127.0.0.1:0").await;
    let client = Arc::new(client_for(&connector, &[("clientMaxPoolSize", "2")]));
    client.connect().await.unwrap();
    let key = client.connected_locator().await.unwrap();

    let calls: Vec<_> = (0..6)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.invoke(json!("slow"), Metadata::new()).await })
        })
        .collect();

    let mut peak = 0;
    for _ in 0..30 {
        let stats = client.pool().stats(&key).await;
        assert!(stats.in_use <= 2, "{:?}", stats);
        peak = peak.max(stats.in_use);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), json!("done"));
    }
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn test_sequential_oneways_arrive_in_order() {
    let (connector, handler) = start_connector("socket://127.0.0.1:0").await;
    let client = client_for(&connector, &[]);
    client.connect().await.unwrap();

    client
        .invoke_oneway(json!("A"), Metadata::new(), false)
        .await
        .unwrap();
    client
        .invoke_oneway(json!("B"), Metadata::new(), false)
        .await
        .unwrap();

    wait_for(|| handler.oneways.lock().unwrap().len() == 2).await;
    assert_eq!(*handler.oneways.lock().unwrap(), vec![json!("A"), json!("B")]);
}

#[tokio::test]
async fn test_async_oneway_returns_immediately() {
    let (connector, handler) = start_connector("http://127.0.0.1:0").await;
    let client = client_for(&connector, &[]);
    client.connect().await.unwrap();

    client
        .invoke_oneway(json!("async"), Metadata::new(), true)
        .await
        .unwrap();
    wait_for(|| !handler.oneways.lock().unwrap().is_empty()).await;
    assert_eq!(*handler.oneways.lock().unwrap(), vec![json!("async")]);
}

// ============================================================================
// Callbacks
// ============================================================================

#[tokio::test]
async fn test_http_explicit_poll_drains_once() {
    let (connector, _) = start_connector("http://127.0.0.1:0").await;
    let client = client_for(&connector, &[]);
    client.connect().await.unwrap();

    connector
        .enqueue_callback(client.client_id(), "test", json!("event-1"))
        .unwrap();

    let first = client.poll_callbacks().await.unwrap();
    let payloads: Vec<_> = first.into_iter().map(|c| c.payload).collect();
    assert_eq!(payloads, vec![json!("event-1")]);
    assert!(client.poll_callbacks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_poller_delivers_with_handback() {
    let (connector, _) = start_connector("http://127.0.0.1:0").await;
    let client = client_for(&connector, &[("callbackPollPeriod", "50")]);
    client.connect().await.unwrap();

    let (handler, seen) = recorder();
    client
        .add_listener(handler.clone(), Metadata::new(), Some(json!("my-handback")))
        .await
        .unwrap();

    let report = connector.publish("test", json!("event-1")).await.unwrap();
    assert_eq!(report.stored, 1);

    wait_for(|| !seen.lock().unwrap().is_empty()).await;
    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, json!("event-1"));
    assert_eq!(delivered[0].handback, Some(json!("my-handback")));

    client.remove_listener(&handler).await.unwrap();
    let report = connector.publish("test", json!("event-2")).await.unwrap();
    assert_eq!(report.pushed + report.stored, 0);
}

#[tokio::test]
async fn test_bisocket_push_reaches_listener() {
    let (connector, _) = start_connector("bisocket://127.0.0.1:0").await;
    let client = client_for(&connector, &[("pingFrequency", "50")]);
    client.connect().await.unwrap();
    wait_for(|| connector.has_control_channel(client.client_id())).await;
    assert!(connector.has_control_channel(client.client_id()));

    let (handler, seen) = recorder();
    client
        .add_listener(handler, Metadata::new(), None)
        .await
        .unwrap();

    let report = connector.publish("test", json!("event-1")).await.unwrap();
    assert_eq!(report.pushed, 1);

    wait_for(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap()[0].payload, json!("event-1"));
    assert_eq!(connector.pending_callbacks(client.client_id()), 0);

    // Pings keep the control connection healthy
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state().await, InvokerState::Connected);
}

#[tokio::test]
async fn test_bisocket_failed_control_notifies_listener() {
    let (mut connector, _) = start_connector("bisocket://127.0.0.1:0").await;
    let client = client_for(
        &connector,
        &[("pingFrequency", "30"), ("maxRetries", "2"), ("timeout", "200")],
    );
    let (failures, listener) = failure_counter();
    client.add_connection_listener(listener);
    client.connect().await.unwrap();

    connector.stop().await.unwrap();
    wait_for(|| failures.load(Ordering::SeqCst) > 0).await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(client.state().await, InvokerState::Failed);
}

#[tokio::test]
async fn test_reverse_callback_server_receives_push() {
    let (connector, _) = start_connector("http://127.0.0.1:0").await;
    let client = client_for(&connector, &[])
        .with_callback_locator("socket://127.0.0.1:0".parse().unwrap());
    client.connect().await.unwrap();

    let (handler, seen) = recorder();
    client
        .add_listener(handler, Metadata::new(), Some(json!(42)))
        .await
        .unwrap();

    let report = connector.publish("test", json!("event-1")).await.unwrap();
    assert_eq!(report.pushed, 1);

    wait_for(|| !seen.lock().unwrap().is_empty()).await;
    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered[0].payload, json!("event-1"));
    assert_eq!(delivered[0].handback, Some(json!(42)));
}

// ============================================================================
// Leases
// ============================================================================

#[tokio::test]
async fn test_vanished_client_fires_exactly_one_server_failure() {
    let (connector, _) = start_connector("socket://127.0.0.1:0/?leasePeriod=50").await;
    let (failures, listener) = failure_counter();
    connector.add_connection_listener(listener);

    let client = client_for(&connector, &[("clientLease", "true"), ("leasePeriod", "50")]);
    client.connect().await.unwrap();
    let client_id = client.client_id().to_string();
    wait_for(|| connector.has_lease(&client_id)).await;
    assert!(connector.has_lease(&client_id));

    // Dropping without disconnect stops the heartbeat silently
    drop(client);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(!connector.has_lease(&client_id));
}

#[tokio::test]
async fn test_lease_survives_saturated_client_pool() {
    let (connector, _) = start_connector("socket://127.0.0.1:0/?leasePeriod=50").await;
    let (server_failures, server_listener) = failure_counter();
    connector.add_connection_listener(server_listener);

    let client = client_for(
        &connector,
        &[("clientLease", "true"), ("leasePeriod", "50"), ("clientMaxPoolSize", "1")],
    );
    let (client_failures, client_listener) = failure_counter();
    client.add_connection_listener(client_listener);
    client.connect().await.unwrap();
    let client_id = client.client_id().to_string();
    wait_for(|| connector.has_lease(&client_id)).await;

    // Each call holds the only pooled connection for 200ms
    for _ in 0..3 {
        assert_eq!(
            client.invoke(json!("slow"), Metadata::new()).await.unwrap(),
            json!("done")
        );
    }

    assert_eq!(server_failures.load(Ordering::SeqCst), 0);
    assert_eq!(client_failures.load(Ordering::SeqCst), 0);
    assert!(connector.has_lease(&client_id));
}

#[tokio::test]
async fn test_clean_disconnect_ends_lease_without_failure() {
    let (connector, _) = start_connector("socket://127.0.0.1:0/?leasePeriod=50").await;
    let (failures, listener) = failure_counter();
    connector.add_connection_listener(listener);

    let client = client_for(&connector, &[("clientLease", "true"), ("leasePeriod", "50")]);
    client.connect().await.unwrap();
    let client_id = client.client_id().to_string();
    wait_for(|| connector.has_lease(&client_id)).await;

    client.disconnect().await.unwrap();
    assert!(!connector.has_lease(&client_id));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_client_lease_notices_dead_server() {
    let (mut connector, _) = start_connector("socket://127.0.0.1:0").await;
    let client = client_for(
        &connector,
        &[
            ("clientLease", "true"),
            ("leasePeriod", "50"),
            ("timeout", "200"),
            ("numberOfCallRetries", "1"),
        ],
    );
    let (failures, listener) = failure_counter();
    client.add_connection_listener(listener);
    client.connect().await.unwrap();

    connector.stop().await.unwrap();
    wait_for(|| failures.load(Ordering::SeqCst) > 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(client.state().await, InvokerState::Failed);
}
