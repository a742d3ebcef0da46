//! End-to-end tests against a mock control plane served by axum on an
//! ephemeral port.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use fleetd::agent::{Agent, ConnectionState};
use fleetd::config::Config;
use fleetd::credentials::{CredentialManager, CredentialPair, CredentialSchedule};
use fleetd::error::{EnrollmentError, NetworkError};
use fleetd::facts::{DeviceInfo, StaticFactProvider};
use fleetd::net::{ApiClient, HttpTransport, RefreshClient};
use fleetd::notifications::NotificationLog;
use fleetd::secrets::MemorySecretStore;

const SERVICE_KEY: &str = "svc-key";

/// Shared state of the mock control plane.
#[derive(Default)]
struct ControlPlane {
    enroll_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    /// Bearer token the server currently accepts.
    valid_token: StdMutex<String>,
    /// When set, every bearer endpoint returns 401 regardless of token.
    always_401: AtomicBool,
    /// Tasks handed out on the next poll, then cleared.
    pending_tasks: StdMutex<Vec<Value>>,
    /// Bodies received on the task-update endpoint.
    task_updates: StdMutex<Vec<Value>>,
    /// Device info received at enrollment.
    enrolled_device: StdMutex<Option<Value>>,
}

impl ControlPlane {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.always_401.load(Ordering::SeqCst) {
            return false;
        }
        let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }

    fn has_service_key(&self, headers: &HeaderMap) -> bool {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == SERVICE_KEY)
            .unwrap_or(false)
    }
}

async fn start_server(cp: Arc<ControlPlane>) -> String {
    let app = Router::new()
        .route("/enroll-agent", post(enroll))
        .route("/agent-token-refresh", post(refresh))
        .route("/agent-get-tasks", post(get_tasks))
        .route("/agent-update-task", post(update_task))
        .route("/agent-telemetry", post(accept))
        .route("/agent-report-data", post(accept))
        .route("/check-agent-status", post(accept))
        .with_state(cp);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn enroll(
    State(cp): State<Arc<ControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    cp.enroll_calls.fetch_add(1, Ordering::SeqCst);
    if !cp.has_service_key(&headers) {
        return (StatusCode::UNAUTHORIZED, "missing service key").into_response();
    }
    if body["token"] != "abc123" {
        return (StatusCode::BAD_REQUEST, "invalid enrollment token").into_response();
    }

    *cp.enrolled_device.lock().unwrap() = Some(body["deviceInfo"].clone());
    *cp.valid_token.lock().unwrap() = "T1".to_string();
    Json(json!({
        "agent_id": "A1",
        "api_token": "T1",
        "refresh_token": "R1",
        "expires_at": Utc::now() + chrono::Duration::hours(1),
    }))
    .into_response()
}

async fn refresh(
    State(cp): State<Arc<ControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !cp.has_service_key(&headers) {
        return (StatusCode::UNAUTHORIZED, "missing service key").into_response();
    }
    if body["refresh_token"] != "R1" {
        return (StatusCode::UNAUTHORIZED, "unknown refresh token").into_response();
    }

    let n = cp.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("T{}", n + 1);
    *cp.valid_token.lock().unwrap() = token.clone();
    Json(json!({
        "agent_id": "A1",
        "access_token": token,
        "expires_at": Utc::now() + chrono::Duration::hours(1),
    }))
    .into_response()
}

async fn get_tasks(
    State(cp): State<Arc<ControlPlane>>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> Response {
    if !cp.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    let tasks: Vec<Value> = cp.pending_tasks.lock().unwrap().drain(..).collect();
    Json(json!({ "tasks": tasks })).into_response()
}

async fn update_task(
    State(cp): State<Arc<ControlPlane>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !cp.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    cp.task_updates.lock().unwrap().push(body);
    Json(json!({ "ok": true })).into_response()
}

async fn accept(
    State(cp): State<Arc<ControlPlane>>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> Response {
    if !cp.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    Json(json!({ "ok": true })).into_response()
}

fn test_facts() -> Arc<StaticFactProvider> {
    Arc::new(StaticFactProvider::new(DeviceInfo {
        hostname: "mac-042".to_string(),
        os: "macos".to_string(),
        os_version: "14.5".to_string(),
        arch: "arm64".to_string(),
        cpu_model: "Test CPU".to_string(),
        total_memory: 16 * 1024 * 1024 * 1024,
        mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
        serial_number: "C02ABC".to_string(),
    }))
}

fn test_agent(base_url: &str) -> Arc<Agent> {
    let mut config = Config::for_base_url(base_url, SERVICE_KEY);
    config.task_poll_interval = Duration::from_millis(100);
    config.telemetry_interval = Duration::from_secs(60);
    config.device_report_interval = Duration::from_secs(60);
    config.heartbeat_interval = Duration::from_secs(60);
    Agent::new(config, Arc::new(MemorySecretStore::new()), test_facts())
}

/// Direct client stack for the retry and circuit-breaker tests.
fn test_client(base_url: &str) -> (Arc<CredentialManager>, ApiClient) {
    let config = Config::for_base_url(base_url, SERVICE_KEY);
    let transport = Arc::new(HttpTransport::new(&config));
    let notifications = Arc::new(NotificationLog::new());
    let credentials = CredentialManager::new(
        Arc::new(MemorySecretStore::new()),
        "test",
        Arc::new(RefreshClient::new(transport.clone())),
        notifications.clone(),
        CredentialSchedule::default(),
    );
    let api = ApiClient::new(transport, credentials.clone(), notifications);
    (credentials, api)
}

fn live_pair(access_token: &str) -> CredentialPair {
    let now = Utc::now();
    CredentialPair {
        access_token: secrecy::SecretString::from(access_token.to_string()),
        refresh_token: secrecy::SecretString::from("R1".to_string()),
        agent_id: "A1".to_string(),
        access_expires_at: now + chrono::Duration::hours(1),
        refresh_expires_at: now + chrono::Duration::days(30),
        issued_at: now,
    }
}

#[tokio::test]
async fn test_enrollment_end_to_end() {
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let agent = test_agent(&base_url);

    agent.enroll("abc123").await.unwrap();

    assert_eq!(agent.status().await, ConnectionState::Authenticated);
    assert_eq!(agent.agent_id().await.as_deref(), Some("A1"));

    let device = cp.enrolled_device.lock().unwrap().clone().unwrap();
    assert_eq!(device["hostname"], "mac-042");
    assert_eq!(device["serial_number"], "C02ABC");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_enrollment_with_bad_token_is_terminal() {
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let agent = test_agent(&base_url);

    let err = agent.enroll("wrong").await.unwrap_err();
    assert!(matches!(err, EnrollmentError::TokenInvalid));
    assert_eq!(agent.status().await, ConnectionState::Error);
    // Terminal: exactly one attempt, no automatic retry.
    assert_eq!(cp.enroll_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_round_trip() {
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let agent = test_agent(&base_url);

    agent.enroll("abc123").await.unwrap();
    cp.pending_tasks.lock().unwrap().push(json!({
        "task_id": "task-1",
        "type": "run_command",
        "payload": { "command": "echo hi" },
    }));

    // The poll loop runs every 100 ms; wait for the result to land.
    let mut update = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(u) = cp.task_updates.lock().unwrap().first().cloned() {
            update = Some(u);
            break;
        }
    }
    agent.shutdown().await;

    let update = update.expect("task result was never reported");
    assert_eq!(update["task_id"], "task-1");
    assert_eq!(update["status"], "completed");
    assert_eq!(update["result"]["output"], "hi\n");
    assert_eq!(update["result"]["exit_code"], 0);
}

#[tokio::test]
async fn test_401_refreshes_once_and_retries() {
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let (credentials, api) = test_client(&base_url);

    credentials.store(live_pair("T1")).await.unwrap();
    // The server already moved on from T1.
    *cp.valid_token.lock().unwrap() = "T2".to_string();

    let tasks = api.fetch_tasks("A1", &json!({})).await.unwrap();
    assert!(tasks.is_empty());
    assert_eq!(cp.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_persistent_401_breaks_circuit_and_clears_credentials() {
    let cp = Arc::new(ControlPlane::default());
    cp.always_401.store(true, Ordering::SeqCst);
    let base_url = start_server(cp.clone()).await;
    let (credentials, api) = test_client(&base_url);

    credentials.store(live_pair("T1")).await.unwrap();

    let err = api.fetch_tasks("A1", &json!({})).await.unwrap_err();
    assert!(matches!(err, NetworkError::ReenrollmentRequired));
    // Exactly three refresh attempts before the circuit breaks.
    assert_eq!(cp.refresh_calls.load(Ordering::SeqCst), 3);
    assert!(!credentials.has_credentials().await);
}

#[tokio::test]
async fn test_agent_not_found_is_not_retried() {
    // No server at all would be a transport error; a 404 needs a route that
    // does not exist on the mock, which axum answers with 404.
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let (credentials, api) = test_client(&format!("{base_url}/missing"));

    credentials.store(live_pair("T1")).await.unwrap();

    let err = api.fetch_tasks("A1", &json!({})).await.unwrap_err();
    assert!(matches!(err, NetworkError::AgentNotFound));
    assert_eq!(cp.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let cp = Arc::new(ControlPlane::default());
    let base_url = start_server(cp.clone()).await;
    let store = Arc::new(MemorySecretStore::new());

    let mut config = Config::for_base_url(&base_url, SERVICE_KEY);
    config.task_poll_interval = Duration::from_secs(60);

    let first = Agent::new(config.clone(), store.clone(), test_facts());
    first.enroll("abc123").await.unwrap();
    first.shutdown().await;
    drop(first);

    let second = Agent::new(config, store, test_facts());
    let state = second.initialize().await.unwrap();
    assert_eq!(state, ConnectionState::Authenticated);
    assert_eq!(second.agent_id().await.as_deref(), Some("A1"));
    second.shutdown().await;
}
