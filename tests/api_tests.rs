//! HTTP, SSE and WebSocket integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tower::util::ServiceExt;

use streamhub::api::AppState;
use streamhub::config::ServerConfig;
use streamhub::server::Server;

struct TestApp {
    server: Server,
    _dir: TempDir,
}

impl TestApp {
    fn new(event_log: bool) -> Self {
        Self::with_config(event_log, |_| {})
    }

    fn with_config(event_log: bool, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            workflow_dir: dir.path().to_path_buf(),
            event_log,
            ..Default::default()
        };
        tweak(&mut config);
        Self {
            server: Server::build(config).unwrap(),
            _dir: dir,
        }
    }

    fn router(&self) -> Router {
        self.server.router()
    }

    fn state(&self) -> &Arc<AppState> {
        self.server.state()
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_job_lifecycle_over_rest() {
    let app = TestApp::new(true);

    let response = app
        .router()
        .oneshot(json_request("POST", "/jobs", json!({"type": "bogus"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_JOB_TYPE");

    let response = app
        .router()
        .oneshot(json_request("POST", "/jobs", json!({"type": "cleanup"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job = body_json(response).await["job"].clone();
    assert_eq!(job["type"], "cleanup");
    assert_eq!(job["status"], "pending");
    let id = job["id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..100 {
        let response = app.router().oneshot(get(&format!("/jobs/{}", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        status = body_json(response).await["job"]["status"]
            .as_str()
            .unwrap()
            .to_string();
        if status == "succeeded" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "succeeded");

    // Cancelling a finished job is a no-op
    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/jobs/{}", id))
            .body(Body::empty())
            .unwrap()
    };
    for _ in 0..2 {
        let response = app.router().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["job"]["status"], "succeeded");
    }

    let response = app.router().oneshot(get("/jobs/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.router().oneshot(get("/jobs")).await.unwrap();
    assert_eq!(body_json(response).await["total"], 1);
}

#[tokio::test]
async fn test_pipeline_endpoints() {
    let app = TestApp::new(true);

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/pipelines/validate",
            json!({"workflow": "name: v\nsteps: []\n"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["valid"], false);
    assert_eq!(report["step_count"], 0);

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/pipelines/exec",
            json!({
                "workflow": {"name": "inline", "steps": [{"id": "a", "command": "echo ${session}"}]},
                "session": "s9",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let run = body_json(response).await["run"].clone();
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["steps"][0]["output"], "s9");
    let run_id = run["run_id"].as_str().unwrap().to_string();

    let response = app
        .router()
        .oneshot(json_request("POST", &format!("/pipelines/{}/cancel", run_id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "PIPELINE_NOT_CANCELLABLE");

    let response = app
        .router()
        .oneshot(get(&format!("/pipelines/{}", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["run"]["workflow_id"], "inline");

    let response = app.router().oneshot(get("/pipelines/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/pipelines/run",
            json!({"workflow_file": "missing.yaml", "session": "s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_WORKFLOW");
}

#[tokio::test]
async fn test_sse_replay() {
    let app = TestApp::new(true);
    let hub = &app.state().hub;
    hub.publish("sessions:a", "session.started", &json!({"n": 1})).unwrap();
    hub.publish("panes:a:0", "pane.output", &json!({"n": 2})).unwrap();

    let response = app
        .router()
        .oneshot(get("/events?since=0&topic=panes:*"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("id: 2"));
    assert!(text.contains(r#""type":"pane.output""#));
    assert!(!text.contains("session.started"));

    let response = app
        .router()
        .oneshot(get("/events?topic=panes*"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_and_dropped_endpoints() {
    let app = TestApp::new(true);
    let response = app.router().oneshot(get("/events/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["store"]["buffer"]["capacity"], 10_000);
    assert_eq!(stats["hub"]["clients"], 0);
    assert_eq!(stats["persistent"], true);
    assert_eq!(stats["buffer_fill"], 0.0);

    let response = app.router().oneshot(get("/events/dropped")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let memory_only = TestApp::new(false);
    memory_only
        .state()
        .hub
        .publish("sessions:a", "session.started", &json!({"n": 1}))
        .unwrap();
    let response = memory_only.router().oneshot(get("/events/stats")).await.unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["persistent"], false);
    assert_eq!(stats["buffer_fill"], 0.0001);

    let response = memory_only
        .router()
        .oneshot(get("/events/dropped"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "DEPENDENCY_MISSING");
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket timed out")
            .expect("websocket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_websocket_session() {
    let app = TestApp::new(false);
    let state = app.state().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(app.server.serve_on(listener, async move {
        let _ = stopped.await;
    }));

    state
        .hub
        .publish("sessions:a", "session.started", &json!({"n": 1}))
        .unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?topics=sessions:*", addr))
        .await
        .unwrap();
    let connected = next_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["current_seq"], 1);

    // Replay what happened before connecting
    send_json(&mut ws, json!({"type": "resume", "since": 0})).await;
    let replayed = next_json(&mut ws).await;
    assert_eq!(replayed["seq"], 1);
    assert_eq!(replayed["type"], "session.started");

    state
        .hub
        .publish("sessions:a", "session.updated", &json!({"n": 2}))
        .unwrap();
    state
        .hub
        .publish("panes:a:0", "pane.output", &json!({"n": 3}))
        .unwrap();
    let live = next_json(&mut ws).await;
    assert_eq!(live["seq"], 2);
    assert_eq!(live["topic"], "sessions:a");

    send_json(&mut ws, json!({"type": "subscribe", "topics": [""]})).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "INVALID_PATTERN");

    send_json(&mut ws, json!({"type": "subscribe", "topics": ["panes:*"]})).await;
    let subscribed = next_json(&mut ws).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["topics"], json!(["sessions:*", "panes:*"]));

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["code"], "BAD_REQUEST");

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    ws.close(None).await.unwrap();
    stop.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

async fn client_count(app: &Arc<AppState>) -> usize {
    app.hub.stats().await.unwrap().clients
}

#[tokio::test]
async fn test_idle_websocket_is_evicted_without_drop_record() {
    let app = TestApp::with_config(true, |config| {
        config.idle_timeout = Duration::from_millis(200);
    });
    let state = app.state().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(app.server.serve_on(listener, async move {
        let _ = stopped.await;
    }));

    // never polled, so server pings go unanswered
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?topics=*", addr))
        .await
        .unwrap();

    let mut seen = false;
    let mut evicted = false;
    for _ in 0..250 {
        let clients = client_count(&state).await;
        seen |= clients == 1;
        if seen && clients == 0 {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen, "client never registered");
    assert!(evicted, "idle client still registered");

    let records = state.store().dropped_events(None, 0).await.unwrap();
    assert!(records.is_empty());

    drop(ws);
    stop.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}
