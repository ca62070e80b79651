mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use counterd::client::{ClientConfig, ClientEvent, CounterClient};
use counterd::codec::{decode_server_message, OperationKind};
use counterd::server::{self, AppState};
use counterd::types::{Attribution, BigCount, Operation};
use counterd::{ClientMessage, Config, CounterStore, ServerMessage, StorePaymentVerifier};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<counterd::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(admin_token: Option<&str>, idle_timeout: Duration) -> Self {
        Self::start_with(admin_token, idle_timeout, None).await
    }

    /// `verify_delay` slows every payment lookup down by that much.
    async fn start_with(admin_token: Option<&str>, idle_timeout: Duration, verify_delay: Option<Duration>) -> Self {
        let (dir, path) = common::create_temp_db_path("server.db");
        let config = Config {
            store_path: path,
            idle_timeout,
            presence_interval: Duration::from_millis(50),
            feed_poll_interval: Duration::from_millis(20),
            history_interval: None,
            log_retention: None,
            admin_token: admin_token.map(str::to_string),
            ..Config::default()
        };

        let state = match verify_delay {
            None => AppState::open(&config).await.unwrap(),
            Some(delay) => {
                let store = CounterStore::open_with_config(&config.store_path, config.store_config())
                    .await
                    .unwrap();
                let verifier = Arc::new(StorePaymentVerifier::with_delay(store.clone(), delay));
                AppState::from_parts(&config, store, verifier).await.unwrap()
            }
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(listener, state.clone(), async move {
            let _ = stopped.await;
        }));

        Self {
            addr,
            state,
            stop,
            handle,
            _dir: dir,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Socket {
        let (socket, _) = connect_async(self.ws_url()).await.unwrap();
        socket
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.state.clone().shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

async fn send(socket: &mut Socket, text: &str) {
    socket.send(Message::text(text.to_string())).await.unwrap();
}

async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("socket ok");
        if let Message::Text(text) = frame {
            return decode_server_message(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let next = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

fn count(value: u64, operation: Option<OperationKind>, multiply_amount: Option<u64>) -> ServerMessage {
    ServerMessage::Count {
        count: BigCount::from(value),
        operation,
        multiply_amount,
    }
}

/// Minimal HTTP/1.1 request; returns status and body.
async fn http(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_protocol_round_trip() {
    let server = TestServer::start(None, Duration::from_secs(30)).await;

    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    assert_eq!(next_message(&mut alice).await, count(0, None, None));
    assert_eq!(next_message(&mut bob).await, count(0, None, None));

    // Increments reach everyone, sender included.
    send(&mut alice, r#"{"type":"increment","country_code":"US","country_name":"United States"}"#).await;
    let expected = count(1, Some(OperationKind::Increment), None);
    assert_eq!(next_message(&mut alice).await, expected);
    assert_eq!(next_message(&mut bob).await, expected);

    // Replies go to the asker only.
    send(&mut alice, r#"{"type":"ping"}"#).await;
    assert_eq!(next_message(&mut alice).await, ServerMessage::Pong);

    send(&mut alice, r#"{"type":"get_viewer_count"}"#).await;
    assert_eq!(next_message(&mut alice).await, ServerMessage::ViewerCount { count: 2 });

    send(&mut alice, "{not json").await;
    assert!(matches!(next_message(&mut alice).await, ServerMessage::Error { .. }));

    send(
        &mut alice,
        r#"{"type":"increment","operation":"multiply","multiply_amount":2,"payment_intent_id":"pi_x"}"#,
    )
    .await;
    match next_message(&mut alice).await {
        ServerMessage::Error { count } => assert!(count.contains("signed in"), "{count}"),
        other => panic!("expected error, got {other:?}"),
    }

    assert_silent(&mut bob).await;

    // The connection survived every rejection.
    send(&mut alice, r#"{"type":"ping"}"#).await;
    assert_eq!(next_message(&mut alice).await, ServerMessage::Pong);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paid_multiply_through_webhook() {
    let server = TestServer::start(Some("s3cret"), Duration::from_secs(30)).await;
    let webhook = r#"{"payment_intent_id":"pi_paid","amount":3,"currency":"USD"}"#;
    let json = ("Content-Type", "application/json");

    let (status, _) = http(server.addr, "POST", "/api/payments", &[json], webhook).await;
    assert_eq!(status, 403);
    let (status, _) = http(
        server.addr,
        "POST",
        "/api/payments",
        &[json, ("Authorization", "Bearer wrong")],
        webhook,
    )
    .await;
    assert_eq!(status, 403);
    let (status, _) = http(
        server.addr,
        "POST",
        "/api/payments",
        &[json, ("Authorization", "Bearer s3cret")],
        webhook,
    )
    .await;
    assert_eq!(status, 204);

    let mut socket = server.connect().await;
    next_message(&mut socket).await;
    send(&mut socket, r#"{"type":"increment"}"#).await;
    next_message(&mut socket).await;

    let multiply = r#"{"type":"increment","operation":"multiply","multiply_amount":3,"payment_intent_id":"pi_paid","user_id":"payer"}"#;
    send(&mut socket, multiply).await;
    assert_eq!(
        next_message(&mut socket).await,
        count(3, Some(OperationKind::Multiply), Some(3))
    );

    // Same user again: the daily limit answers first.
    send(&mut socket, multiply).await;
    match next_message(&mut socket).await {
        ServerMessage::RateLimited { count } => {
            assert!(count.contains("you can only multiply once per day"), "{count}")
        }
        other => panic!("expected rate_limited, got {other:?}"),
    }

    // Another user replaying the intent.
    let replay = r#"{"type":"increment","operation":"multiply","multiply_amount":3,"payment_intent_id":"pi_paid","user_id":"thief"}"#;
    send(&mut socket, replay).await;
    match next_message(&mut socket).await {
        ServerMessage::Error { count } => assert!(count.contains("already been used"), "{count}"),
        other => panic!("expected error, got {other:?}"),
    }

    assert_eq!(server.state.store.get().await.unwrap().value, BigCount::from(3));

    server.stop().await;
}

#[tokio::test]
async fn http_endpoints() {
    let server = TestServer::start(None, Duration::from_secs(30)).await;

    let (status, body) = http(server.addr, "POST", "/api/ping", &[], "").await;
    assert_eq!(status, 200);
    assert!(body.contains("pong"));

    let (status, body) = http(server.addr, "GET", "/api/counter", &[], "").await;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["count"], "0");
    assert_eq!(value["pos"], 0);

    let (status, body) = http(server.addr, "GET", "/api/viewers", &[], "").await;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["count"], 0);

    server.state.store.snapshot_history().await.unwrap();
    let (status, body) = http(server.addr, "GET", "/api/counter/history?range=hour", &[], "").await;
    assert_eq!(status, 200);
    let points: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0]["count"], "0");

    let (status, _) = http(server.addr, "GET", "/api/counter/history?range=decade", &[], "").await;
    assert_eq!(status, 400);

    // No token configured: the webhook does not exist.
    let (status, _) = http(
        server.addr,
        "POST",
        "/api/payments",
        &[("Content-Type", "application/json")],
        r#"{"payment_intent_id":"pi","amount":2,"currency":"usd"}"#,
    )
    .await;
    assert_eq!(status, 404);

    server.stop().await;
}

#[tokio::test]
async fn idle_session_is_closed_and_unregistered() {
    let server = TestServer::start(None, Duration::from_millis(200)).await;

    let mut socket = server.connect().await;
    next_message(&mut socket).await;
    assert_eq!(server.state.broadcaster.registry().viewer_count(), 1);

    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle session was not closed");

    common::eventually(Duration::from_secs(2), Duration::from_millis(20), || {
        server.state.broadcaster.registry().is_empty().then_some(())
    })
    .await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_payment_check_does_not_stall_the_connection() {
    // The payment lookup takes longer than the idle timeout.
    let server = TestServer::start_with(None, Duration::from_millis(300), Some(Duration::from_millis(800))).await;
    server.state.store.confirm_payment("pi_slow", 2, "usd").await.unwrap();

    let mut socket = server.connect().await;
    next_message(&mut socket).await;
    send(&mut socket, r#"{"type":"increment"}"#).await;
    assert_eq!(next_message(&mut socket).await, count(1, Some(OperationKind::Increment), None));

    send(
        &mut socket,
        r#"{"type":"increment","operation":"multiply","multiply_amount":2,"payment_intent_id":"pi_slow","user_id":"payer"}"#,
    )
    .await;

    // Keep pinging while the multiply is being verified. Every ping must
    // be answered and the connection must stay open.
    let mut pongs = 0;
    let mut multiplied = false;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < deadline {
        send(&mut socket, r#"{"type":"ping"}"#).await;
        match tokio::time::timeout(Duration::from_millis(100), socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match decode_server_message(text.as_str()).unwrap() {
                ServerMessage::Pong => pongs += 1,
                message => {
                    assert_eq!(message, count(2, Some(OperationKind::Multiply), Some(2)));
                    multiplied = true;
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                panic!("connection closed while the client was pinging")
            }
            Ok(Some(Ok(_))) | Err(_) => {}
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(multiplied, "multiply was not broadcast");
    assert!(pongs >= 5, "only {pongs} pongs during the payment check");
    assert_eq!(server.state.broadcaster.registry().viewer_count(), 1);

    server.stop().await;
}

/// Next client event, skipping keepalive pongs.
async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("client running");
        if event != ClientEvent::Message(ServerMessage::Pong) {
            return event;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnecting_client_follows_the_counter() {
    let server = TestServer::start(None, Duration::from_secs(30)).await;

    let config = ClientConfig {
        ping_interval: Duration::from_millis(100),
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
    };
    let (client, mut events) = CounterClient::connect_with_config(server.ws_url(), config);

    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    assert_eq!(next_event(&mut events).await, ClientEvent::Message(count(0, None, None)));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Message(ServerMessage::ViewerCount { count: 1 })
    );

    client
        .send(ClientMessage::Operation(Operation::Increment {
            attribution: Attribution::anonymous(),
        }))
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Message(count(1, Some(OperationKind::Increment), None))
    );

    client.close().await;
    server.stop().await;
}
