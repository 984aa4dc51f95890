use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rinvoke_common::locator::{params, Locator};
use rinvoke_common::transport::{
    bind, dial, dialer_for, read_frame, write_frame, ConnectionContext, ControlChannel,
    DialOptions, Frame, FrameKind, InvocationSink, ServerOptions, TlsContext,
};
use rinvoke_common::marshal::{JsonMarshaller, MarshallerRegistry};
use rinvoke_common::{
    Callback, FailureKind, InvocationKind, InvocationRequest, InvocationResponse, RinvokeError,
};
use serde_json::json;
use tokio::sync::watch;

/// Echoes invocations and records oneway payloads.
#[derive(Default)]
struct EchoSink {
    oneways: Mutex<Vec<serde_json::Value>>,
    control: Mutex<Option<ControlChannel>>,
}

#[async_trait]
impl InvocationSink for EchoSink {
    async fn handle(
        &self,
        request: InvocationRequest,
        _ctx: &ConnectionContext,
    ) -> Option<InvocationResponse> {
        match request.kind {
            InvocationKind::Oneway => {
                self.oneways.lock().unwrap().push(request.payload);
                None
            }
            InvocationKind::Ping => Some(InvocationResponse::success(request.id, json!(null))),
            _ if request.subsystem == "test" => {
                Some(InvocationResponse::success(request.id, request.payload))
            }
            _ => Some(InvocationResponse::error(
                request.id,
                FailureKind::NoSuchHandler,
                request.subsystem,
            )),
        }
    }

    fn open_control(&self, channel: ControlChannel) {
        *self.control.lock().unwrap() = Some(channel);
    }

    fn close_control(&self, _client_id: &str, _connection_id: u64) {
        self.control.lock().unwrap().take();
    }
}

async fn start(locator: &str, options: ServerOptions) -> (Locator, Arc<EchoSink>, watch::Sender<bool>) {
    let locator: Locator = locator.parse().unwrap();
    let server = bind(&locator, options).await.unwrap();
    let bound = server.locator().clone();
    let sink = Arc::new(EchoSink::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve_sink: Arc<dyn InvocationSink> = sink.clone();
    tokio::spawn(async move {
        server.serve(serve_sink, shutdown_rx).await.unwrap();
    });
    (bound, sink, shutdown_tx)
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_socket_exchange_reuses_connection() {
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;
    assert_ne!(locator.port(), 0);

    let dialer = dialer_for(&locator, DialOptions::default()).unwrap();
    let mut channel = dialer.dial(&locator).await.unwrap();
    for word in ["foo", "bar", "baz"] {
        let request = InvocationRequest::invoke("test", json!(word));
        let response = channel.exchange(&request).await.unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.into_result().unwrap(), json!(word));
    }
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_remote_failure_keeps_connection_open() {
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;
    let dialer = dialer_for(&locator, DialOptions::default()).unwrap();
    let mut channel = dialer.dial(&locator).await.unwrap();

    let response = channel
        .exchange(&InvocationRequest::invoke("missing", json!(1)))
        .await
        .unwrap();
    assert!(matches!(response.into_result(), Err(RinvokeError::NoSuchHandler(_))));
    assert!(channel.is_open());
    channel.probe().await.unwrap();
}

#[tokio::test]
async fn test_heterogeneous_marshallers_against_one_server() {
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;

    for serialization in ["json", "postcard"] {
        let client_locator = locator.clone().with_param(params::SERIALIZATION_TYPE, serialization);
        let dialer = dialer_for(&client_locator, DialOptions::default()).unwrap();
        let mut channel = dialer.dial(&client_locator).await.unwrap();
        let response = channel
            .exchange(&InvocationRequest::invoke("test", json!({"via": serialization})))
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"via": serialization}));
    }
}

#[tokio::test]
async fn test_undecodable_request_gets_marshalling_failure() {
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;
    let mut stream = dial(&locator, None, Duration::from_secs(5)).await.unwrap();

    let garbage = Frame {
        kind: FrameKind::Request,
        marshaller: "json".to_string(),
        body: b"{not json".to_vec(),
    };
    write_frame(&mut stream, &garbage).await.unwrap();
    let reply = read_frame(&mut stream).await.unwrap().unwrap();
    let response = reply.decode_response(&MarshallerRegistry::default()).unwrap();
    assert!(matches!(response.into_result(), Err(RinvokeError::Marshalling(_))));

    // Same connection still serves well-formed requests
    let request = InvocationRequest::invoke("test", json!("ok"));
    write_frame(&mut stream, &Frame::request(&JsonMarshaller, &request).unwrap())
        .await
        .unwrap();
    let reply = read_frame(&mut stream).await.unwrap().unwrap();
    let response = reply.decode_response(&MarshallerRegistry::default()).unwrap();
    assert_eq!(response.into_result().unwrap(), json!("ok"));
}

#[tokio::test]
async fn test_http_exchange_and_oneway() {
    let (locator, sink, _shutdown) = start("http://127.0.0.1:0/invoker", ServerOptions::default()).await;
    let client_locator = locator.clone().with_param(params::SERIALIZATION_TYPE, "postcard");
    let dialer = dialer_for(&client_locator, DialOptions::default()).unwrap();
    let mut channel = dialer.dial(&client_locator).await.unwrap();

    let response = channel
        .exchange(&InvocationRequest::invoke("test", json!("foo")))
        .await
        .unwrap();
    assert_eq!(response.into_result().unwrap(), json!("foo"));

    channel
        .send_oneway(&InvocationRequest::oneway("test", json!("A")))
        .await
        .unwrap();
    wait_until(|| sink.oneways.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn test_http_rejects_control_channel() {
    let (locator, _sink, _shutdown) = start("http://127.0.0.1:0", ServerOptions::default()).await;
    let dialer = dialer_for(&locator, DialOptions::default()).unwrap();
    let mut channel = dialer.dial(&locator).await.unwrap();

    let response = channel
        .exchange(&InvocationRequest::control(InvocationKind::OpenControl).with_client_id("c1"))
        .await
        .unwrap();
    assert!(matches!(response.into_result(), Err(RinvokeError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_tls_socket_and_https() {
    let tls = TlsContext::self_signed(vec!["localhost".to_string()])
        .unwrap()
        .with_server_name("localhost");

    for scheme in ["sslsocket", "https"] {
        let options = ServerOptions {
            tls: Some(tls.clone()),
            ..ServerOptions::default()
        };
        let (locator, _sink, _shutdown) = start(&format!("{}://127.0.0.1:0", scheme), options).await;

        let dialer = dialer_for(&locator, DialOptions::default().with_tls(tls.clone())).unwrap();
        let mut channel = dialer.dial(&locator).await.unwrap();
        let response = channel
            .exchange(&InvocationRequest::invoke("test", json!(scheme)))
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!(scheme));
    }
}

#[tokio::test]
async fn test_tls_client_rejects_untrusted_server() {
    let server_tls = TlsContext::self_signed(vec!["localhost".to_string()]).unwrap();
    let client_tls = TlsContext::self_signed(vec!["localhost".to_string()])
        .unwrap()
        .with_server_name("localhost");
    let options = ServerOptions {
        tls: Some(server_tls),
        ..ServerOptions::default()
    };
    let (locator, _sink, _shutdown) = start("sslsocket://127.0.0.1:0", options).await;

    let dialer = dialer_for(&locator, DialOptions::default().with_tls(client_tls)).unwrap();
    assert!(matches!(
        dialer.dial(&locator).await,
        Err(RinvokeError::CannotConnect { .. })
    ));
}

#[tokio::test]
async fn test_bisocket_control_channel_carries_pushes_and_pings() {
    let (locator, sink, _shutdown) = start("bisocket://127.0.0.1:0", ServerOptions::default()).await;
    let registry = MarshallerRegistry::default();
    let mut stream = dial(&locator, None, Duration::from_secs(5)).await.unwrap();

    let open = InvocationRequest::control(InvocationKind::OpenControl).with_client_id("client-1");
    write_frame(&mut stream, &Frame::request(&JsonMarshaller, &open).unwrap())
        .await
        .unwrap();
    let ack = read_frame(&mut stream).await.unwrap().unwrap();
    assert!(ack.decode_response(&registry).unwrap().success);

    wait_until(|| sink.control.lock().unwrap().is_some()).await;
    let channel = sink.control.lock().unwrap().clone().unwrap();
    assert_eq!(channel.client_id(), "client-1");
    channel
        .push(Callback::new("listener-1", "events", json!("event-1")))
        .await
        .unwrap();

    let pushed = read_frame(&mut stream).await.unwrap().unwrap();
    let request = pushed.decode_request(&registry).unwrap();
    assert_eq!(request.kind, InvocationKind::Callback);
    let callback: Callback = serde_json::from_value(request.payload).unwrap();
    assert_eq!(callback.listener_id, "listener-1");
    assert_eq!(callback.payload, json!("event-1"));

    let ping = InvocationRequest::control(InvocationKind::Ping).with_client_id("client-1");
    write_frame(&mut stream, &Frame::request(&JsonMarshaller, &ping).unwrap())
        .await
        .unwrap();
    let pong = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(pong.decode_response(&registry).unwrap().id, ping.id);

    drop(stream);
    wait_until(|| sink.control.lock().unwrap().is_none()).await;
}

#[tokio::test]
async fn test_plain_socket_refuses_control_channel() {
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;
    let dialer = dialer_for(&locator, DialOptions::default()).unwrap();
    let mut channel = dialer.dial(&locator).await.unwrap();
    let response = channel
        .exchange(&InvocationRequest::control(InvocationKind::OpenControl).with_client_id("c1"))
        .await
        .unwrap();
    assert!(matches!(response.into_result(), Err(RinvokeError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_idle_connections_are_closed() {
    let options = ServerOptions {
        idle_timeout: Some(Duration::from_millis(100)),
        ..ServerOptions::default()
    };
    let (locator, _sink, _shutdown) = start("socket://127.0.0.1:0", options).await;
    let mut stream = dial(&locator, None, Duration::from_secs(5)).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut stream))
        .await
        .unwrap();
    assert!(matches!(closed, Ok(None)));
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (locator, _sink, shutdown) = start("socket://127.0.0.1:0", ServerOptions::default()).await;
    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dialer = dialer_for(&locator.clone().with_param(params::TIMEOUT, "500"), DialOptions::default()).unwrap();
    assert!(dialer.dial(&locator).await.is_err());
}
