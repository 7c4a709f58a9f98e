//! Server connector lifecycle against real sockets.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use http_ws_transport::config::{ClientTlsConfig, Parameter, TlsConfig};
use http_ws_transport::{
    BindError, ConnectionInfo, ConnectorState, HttpWsConnectorFactory, ListenerConfig, SenderConfig,
    ServerConnector, SocketTunables, TransportError, TransportInitializer, TransportProperties,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const BIND_TIMEOUT: Duration = Duration::from_secs(5);

fn app() -> Router {
    Router::new()
        .route("/hello", get(|| async { "hello world" }))
        .route(
            "/stream",
            get(|| async {
                let chunks = futures_util::stream::iter(vec![
                    Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
                    Ok(Bytes::from_static(b"world")),
                ]);
                Body::from_stream(chunks)
            }),
        )
}

fn listener(host: &str, port: u16) -> ListenerConfig {
    ListenerConfig {
        acceptor_threads: Some(1),
        worker_threads: Some(2),
        idle_timeout_ms: 5_000,
        ..ListenerConfig::new(host, port)
    }
}

fn connector(config: &ListenerConfig) -> ServerConnector {
    HttpWsConnectorFactory::new(app())
        .create_server_connector(&SocketTunables::default(), config)
        .unwrap()
}

/// `stop()` blocks until the listener is closed, so run it off the test runtime.
async fn stop(connector: ServerConnector) -> (bool, ServerConnector) {
    tokio::task::spawn_blocking(move || (connector.stop(), connector))
        .await
        .unwrap()
}

#[tokio::test]
async fn start_serve_and_stop() {
    let connector = connector(&listener("127.0.0.1", 0));
    assert_eq!(connector.state(), ConnectorState::Created);

    let future = connector.start().unwrap();
    let addr = future.wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(connector.state(), ConnectorState::Bound);
    assert_eq!(connector.local_addr(), Some(addr));
    assert!(future.is_success());

    let body = reqwest::get(format!("http://{}/hello", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello world");

    let (stopped, connector) = stop(connector).await;
    assert!(stopped);
    assert_eq!(connector.state(), ConnectorState::Closed);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_without_start_returns_false() {
    let connector = connector(&listener("127.0.0.1", 0));
    let (stopped, connector) = stop(connector).await;
    assert!(!stopped);
    assert_eq!(connector.state(), ConnectorState::Created);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let connector = connector(&listener("127.0.0.1", 0));
    let future = connector.start().unwrap();

    let err = connector.start().unwrap_err();
    assert!(matches!(err, TransportError::AlreadyStarted { .. }));

    future.wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();
    let (stopped, _) = stop(connector).await;
    assert!(stopped);
}

#[tokio::test]
async fn occupied_port_fails_the_future() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let connector = connector(&listener("127.0.0.1", port));
    let outcome = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap();
    assert!(matches!(outcome, Err(BindError::AddressInUse { .. })));
    assert_eq!(connector.state(), ConnectorState::Failed);

    // Failed is terminal.
    assert!(matches!(
        connector.start(),
        Err(TransportError::AlreadyStarted { state: "failed", .. })
    ));
    let (stopped, _) = stop(connector).await;
    assert!(!stopped);
}

#[tokio::test]
async fn concurrent_binds_on_one_port_have_one_winner() {
    let port = common::free_port().await;
    let first = connector(&listener("127.0.0.1", port));
    let second = connector(&listener("127.0.0.1", port));

    let a = first.start().unwrap();
    let b = second.start().unwrap();
    let outcomes = [
        a.wait_timeout(BIND_TIMEOUT).await.unwrap(),
        b.wait_timeout(BIND_TIMEOUT).await.unwrap(),
    ];

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    let loser = outcomes.iter().find_map(|o| o.as_ref().err()).unwrap();
    assert!(loser.is_address_in_use());

    let (stopped_a, _) = stop(first).await;
    let (stopped_b, _) = stop(second).await;
    assert!(stopped_a ^ stopped_b);
}

#[tokio::test]
async fn stop_right_after_start_closes_the_listener() {
    let connector = connector(&listener("127.0.0.1", 0));
    let future = connector.start().unwrap();

    // Whether the bind task is still binding or already bound, stop wins.
    let (stopped, connector) = stop(connector).await;
    assert!(stopped);
    assert_eq!(connector.state(), ConnectorState::Closed);

    let addr = future.wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_racing_a_failing_bind_leaves_it_failed() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let connector = connector(&listener("127.0.0.1", port));
    let future = connector.start().unwrap();
    let (stopped, connector) = stop(connector).await;

    assert!(!stopped);
    assert_eq!(connector.state(), ConnectorState::Failed);
    let outcome = future.wait_timeout(BIND_TIMEOUT).await.unwrap();
    assert!(matches!(outcome, Err(BindError::AddressInUse { .. })));
}

#[tokio::test]
async fn broken_certificate_fails_the_bind() {
    let mut config = listener("127.0.0.1", 0);
    config.tls = Some(TlsConfig {
        cert_path: "/nonexistent/cert.pem".into(),
        key_path: "/nonexistent/key.pem".into(),
        protocols: Vec::new(),
        ciphers: Vec::new(),
    });
    let connector = connector(&config);

    let outcome = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap();
    assert!(matches!(outcome, Err(BindError::Tls { .. })));
    assert_eq!(connector.state(), ConnectorState::Failed);
}

#[tokio::test]
async fn tls_listener_serves_pooled_client() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = common::self_signed_cert(dir.path());

    let mut config = listener("localhost", 0);
    config.tls = Some(TlsConfig {
        cert_path: cert.display().to_string(),
        key_path: key.display().to_string(),
        protocols: vec!["TLSv1.3".into()],
        ciphers: Vec::new(),
    });
    let factory = HttpWsConnectorFactory::new(app());
    let connector = factory
        .create_server_connector(&SocketTunables::default(), &config)
        .unwrap();
    let addr = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    let sender = SenderConfig {
        tls: Some(ClientTlsConfig {
            trust_store_path: Some(cert.display().to_string()),
            ..ClientTlsConfig::default()
        }),
        ..SenderConfig::default()
    };
    let client = factory
        .create_http_client_connector(&TransportProperties::default(), &sender)
        .unwrap();

    let request = http::Request::get(format!("https://localhost:{}/hello", addr.port()))
        .body(Body::empty())
        .unwrap();
    let response = client.send(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(&response.body()[..], b"hello world");

    factory.shutdown();
    let (stopped, _) = stop(connector).await;
    assert!(stopped);
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let mut config = listener("127.0.0.1", 0);
    config.idle_timeout_ms = 200;
    let connector = connector(&config);
    let addr = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("idle connection was not closed");
    // Either an orderly EOF or a reset.
    assert!(matches!(read, Ok(0) | Err(_)));

    stop(connector).await;
}

#[tokio::test]
async fn silent_client_on_tls_listener_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = common::self_signed_cert(dir.path());

    let mut config = listener("127.0.0.1", 0);
    config.idle_timeout_ms = 200;
    config.tls = Some(TlsConfig {
        cert_path: cert.display().to_string(),
        key_path: key.display().to_string(),
        protocols: Vec::new(),
        ciphers: Vec::new(),
    });
    let connector = connector(&config);
    let addr = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    // Connect and never start the handshake.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert!(common::wait_until(|| connector.active_connections() == 1, Duration::from_secs(2)).await);

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("silent tls client was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(common::wait_until(|| connector.active_connections() == 0, Duration::from_secs(2)).await);

    stop(connector).await;
}

#[tokio::test]
async fn chunking_setting_controls_response_framing() {
    let chunked = connector(&listener("127.0.0.1", 0));
    let chunked_addr = chunked.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    let mut config = listener("127.0.0.1", 0);
    config.chunking_disabled = true;
    let buffered = connector(&config);
    let buffered_addr = buffered.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    let response = reqwest::get(format!("http://{}/stream", chunked_addr)).await.unwrap();
    assert_eq!(response.headers()["transfer-encoding"], "chunked");
    assert_eq!(response.text().await.unwrap(), "hello world");

    let response = reqwest::get(format!("http://{}/stream", buffered_addr)).await.unwrap();
    assert_eq!(response.headers()["content-length"], "11");
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.text().await.unwrap(), "hello world");

    stop(chunked).await;
    stop(buffered).await;
}

#[derive(Default)]
struct Recording {
    parameters: Mutex<Vec<HashMap<String, String>>>,
    connections: AtomicUsize,
}

impl TransportInitializer for Recording {
    fn setup(&self, parameters: &HashMap<String, String>) {
        self.parameters.lock().unwrap().push(parameters.clone());
    }

    fn on_connection(&self, info: &ConnectionInfo) {
        assert!(info.peer.ip().is_loopback());
        self.connections.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn initializers_see_parameters_and_connections() {
    let recording = Arc::new(Recording::default());
    let factory = HttpWsConnectorFactory::new(app()).with_initializer(recording.clone());

    let mut config = listener("127.0.0.1", 0);
    config.parameters = vec![Parameter::new("region", "eu"), Parameter::new("tier", "gold")];
    let connector = factory
        .create_server_connector(&SocketTunables::default(), &config)
        .unwrap();

    {
        let seen = recording.parameters.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["region"], "eu");
        assert_eq!(seen[0]["tier"], "gold");
    }

    let addr = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hello world"));

    assert_eq!(recording.connections.load(Ordering::SeqCst), 1);
    stop(connector).await;
}

#[tokio::test]
async fn accepted_connections_outlive_stop() {
    let connector = connector(&listener("127.0.0.1", 0));
    let addr = connector.start().unwrap().wait_timeout(BIND_TIMEOUT).await.unwrap().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(request).await.unwrap();
    read_response(&mut stream).await;

    let live = connector.active_connections();
    assert_eq!(live, 1);
    let (stopped, connector) = stop(connector).await;
    assert!(stopped);

    stream.write_all(request).await.unwrap();
    let second = read_response(&mut stream).await;
    assert!(second.starts_with("HTTP/1.1 200"));
    assert_eq!(connector.active_connections(), 1);
    assert_eq!(connector.accepted_connections(), 1);
}

/// Read one keep-alive response whose body is `hello world`.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.ends_with(b"hello world") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(received).unwrap()
}
