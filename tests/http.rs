//! End-to-end: real listener, WebSocket clients, and `/compile` over HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use codebridge::http_server::router;
use codebridge::protocol::{ClientEvent, Member, ServerEvent};
use codebridge::run::NOTICE_COMPLETE;
use codebridge::config::RateLimit;
use codebridge::{AppState, Config, SandboxRuntime};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    _root: TempDir,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn spawn_server() -> Server {
    spawn_server_with(Config::default().rate_limit).await
}

async fn spawn_server_with(rate_limit: Option<RateLimit>) -> Server {
    let root = tempfile::tempdir().unwrap();
    let config = Config {
        staging_root: root.path().to_path_buf(),
        time_limit: Duration::from_secs(10),
        runtime: SandboxRuntime::new("sh", ["{entry}"]),
        rate_limit,
        ..Config::default()
    };
    let app = router(AppState::new(&config)).into_make_service_with_connect_info::<SocketAddr>();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server { addr, _root: root }
}

async fn next_event(ws: &mut Client) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no event within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Client, event: ClientEvent) {
    let json = serde_json::to_string(&event).unwrap();
    ws.send(Message::Text(json)).await.unwrap();
}

async fn connect(server: &Server) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr)).await.unwrap();
    match next_event(&mut ws).await {
        ServerEvent::Connected { connection_id } => (ws, connection_id),
        other => panic!("expected connected, got {:?}", other),
    }
}

async fn join(ws: &mut Client, room: &str, name: &str) -> Vec<Member> {
    send(
        ws,
        ClientEvent::Join {
            room_id: room.into(),
            display_name: name.into(),
        },
    )
    .await;
    match next_event(ws).await {
        ServerEvent::Joined { members, .. } => members,
        other => panic!("expected joined, got {:?}", other),
    }
}

#[tokio::test]
async fn health_check() {
    let server = spawn_server().await;
    let body = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn room_members_share_edits() {
    let server = spawn_server().await;
    let (mut ada, ada_id) = connect(&server).await;
    let (mut bob, bob_id) = connect(&server).await;

    join(&mut ada, "lab", "ada").await;
    let members = join(&mut bob, "lab", "bob").await;
    assert_eq!(members.len(), 2);
    match next_event(&mut ada).await {
        ServerEvent::Joined { connection_id, display_name, .. } => {
            assert_eq!(connection_id, bob_id);
            assert_eq!(display_name, "bob");
        }
        other => panic!("expected joined, got {:?}", other),
    }

    send(&mut ada, ClientEvent::CodeChange { code: "print(1)".into() }).await;
    assert_eq!(
        next_event(&mut bob).await,
        ServerEvent::CodeChange { code: "print(1)".into() }
    );
    assert!(timeout(Duration::from_millis(200), ada.next()).await.is_err());

    let roster: Vec<Value> = reqwest::get(server.url("/rooms/lab"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(roster.len(), 2);

    ada.close(None).await.unwrap();
    assert_eq!(
        next_event(&mut bob).await,
        ServerEvent::Disconnected {
            connection_id: ada_id,
            display_name: "ada".into(),
        }
    );
}

#[tokio::test]
async fn compile_streams_output_to_submitter() {
    let server = spawn_server().await;
    let (mut ws, conn) = connect(&server).await;
    join(&mut ws, "lab", "ada").await;

    let resp = reqwest::Client::new()
        .post(server.url("/compile"))
        .json(&json!({ "code": "echo hi from sh", "language": "python", "connectionId": conn }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "started");
    let run_id = body["runId"].as_str().unwrap().to_string();

    let mut collected = String::new();
    loop {
        match next_event(&mut ws).await {
            ServerEvent::ProgramOutput { output, run_id: from } => {
                assert_eq!(from, run_id);
                if output == NOTICE_COMPLETE {
                    break;
                }
                collected.push_str(&output);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(collected.contains("hi from sh\n"));
}

#[tokio::test]
async fn compile_rejects_bad_requests() {
    let server = spawn_server().await;
    let (_ws, conn) = connect(&server).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/compile"))
        .json(&json!({ "code": "x", "language": "ruby", "connectionId": conn }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ruby"));

    let resp = client
        .post(server.url("/compile"))
        .json(&json!({ "language": "python", "connectionId": conn }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(server.url("/compile"))
        .json(&json!({ "code": "x", "language": "python", "socketId": "nobody" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn malformed_frames_get_error_event() {
    let server = spawn_server().await;
    let (mut ws, _) = connect(&server).await;

    ws.send(Message::Text("{\"event\":\"bogus\"}".into())).await.unwrap();
    assert!(matches!(next_event(&mut ws).await, ServerEvent::Error { .. }));

    send(&mut ws, ClientEvent::Join { room_id: "".into(), display_name: "x".into() }).await;
    assert!(matches!(next_event(&mut ws).await, ServerEvent::Error { .. }));
}

#[tokio::test]
async fn unparseable_body_is_a_json_bad_request() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/compile"))
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = client
        .post(server.url("/compile"))
        .json(&json!({ "code": 5, "language": "python", "connectionId": "c" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
}

#[tokio::test]
async fn responses_carry_hardening_headers() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let ok = client.get(server.url("/health")).send().await.unwrap();
    let rejected = client
        .post(server.url("/compile"))
        .json(&json!({ "code": "x", "language": "ruby", "connectionId": "c" }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);

    for resp in [&ok, &rejected] {
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
        assert_eq!(resp.headers()["x-frame-options"], "SAMEORIGIN");
        assert!(resp.headers().contains_key("content-security-policy"));
    }
}

#[tokio::test]
async fn requests_over_budget_are_throttled() {
    let server = spawn_server_with(Some(RateLimit {
        requests: 2,
        window: Duration::from_secs(60),
    }))
    .await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client.get(server.url("/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
    let resp = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 429);
    let retry_after: u64 = resp.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Too many requests"));
}
