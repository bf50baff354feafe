//! End-to-end tests against a live control plane: REST queue lifecycle,
//! rules, approve/deny flows, WebSocket relay, and the shutdown
//! sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite;

use fishbowl::audit::AuditLog;
use fishbowl::brokers::{ExecBroker, PackageBroker};
use fishbowl::config::{ConfigStore, RuleKind};
use fishbowl::control::{self, AppState};
use fishbowl::queue::PermissionQueue;
use fishbowl::sync::{FileSync, GitSync, LiveMirror};

struct TestServer {
    base_url: String,
    ws_url: String,
    state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    let host = dir.path().join("host");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(&host).unwrap();

    let audit = AuditLog::new(dir.path().join("data/audit.log"));
    let config = Arc::new(ConfigStore::new(dir.path().join("sandbox.config.json")));
    let queue = PermissionQueue::new(Some(dir.path().join("data/queue.json")), audit.clone());
    let files = Arc::new(FileSync::new(
        workspace.clone(),
        host.clone(),
        queue.clone(),
        config.clone(),
    ));
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(256);

    let state = Arc::new(AppState {
        exec: ExecBroker::new(queue.clone(), config.clone()),
        packages: PackageBroker::new(queue.clone(), config.clone()),
        git: GitSync::new(queue.clone(), config.clone()),
        mirror: LiveMirror::new(workspace.clone(), host.clone()),
        files,
        workspace,
        host_project: host,
        started_at_ms: chrono::Utc::now().timestamp_millis(),
        started_at: Instant::now(),
        max_uptime_ms: None,
        shutdown_tx,
        events,
        queue,
        config,
        audit,
    });

    let app = control::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://127.0.0.1:{}", addr.port()),
        ws_url: format!("ws://127.0.0.1:{}/ws", addr.port()),
        state,
        _dir: dir,
    }
}

async fn post(server: &TestServer, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{}{}", server.base_url, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn get(server: &TestServer, path: &str) -> Value {
    reqwest::get(format!("{}{}", server.base_url, path))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_queue_lifecycle() {
    let server = start_server().await;

    let (status, body) = post(
        &server,
        "/api/queue",
        json!({
            "category": "network",
            "action": "CONNECT test.example.com:443",
            "description": "t"
        }),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(body["id"], "req-0");

    let (status, body) = post(
        &server,
        "/api/queue/req-0/approve",
        json!({"resolvedBy": "web"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);

    let queue = get(&server, "/api/queue").await;
    assert!(queue["pending"].as_array().unwrap().is_empty());
    let recent = queue["recent"].as_array().unwrap();
    let entry = recent
        .iter()
        .find(|r| r["id"] == "req-0")
        .expect("req-0 in recent");
    assert_eq!(entry["status"], "approved");
    assert_eq!(entry["resolvedBy"], "web");
}

#[tokio::test]
async fn test_unknown_category_is_rejected() {
    let server = start_server().await;
    let (status, body) = post(
        &server,
        "/api/queue",
        json!({"category": "bogus", "action": "x", "description": ""}),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("bogus"));
}

#[tokio::test]
async fn test_approve_unknown_id_is_404() {
    let server = start_server().await;
    let (status, body) = post(&server, "/api/queue/req-99/approve", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_double_resolution_fails_cleanly() {
    let server = start_server().await;
    post(
        &server,
        "/api/queue",
        json!({"category": "exec", "action": "ls", "description": ""}),
    )
    .await;
    let (status, _) = post(&server, "/api/queue/req-0/deny", json!({})).await;
    assert_eq!(status, 200);

    // A second resolution reports failure without changing state.
    let (status, body) = post(&server, "/api/queue/req-0/approve", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["ok"], false);
    let queue = get(&server, "/api/queue").await;
    let entry = &queue["recent"].as_array().unwrap()[0];
    assert_eq!(entry["status"], "denied");
}

#[tokio::test]
async fn test_filesystem_supersession_over_rest() {
    let server = start_server().await;

    for version in ["v1", "v2"] {
        post(
            &server,
            "/api/queue",
            json!({
                "category": "filesystem",
                "action": "Write foo.ts",
                "description": "",
                "metadata": {
                    "toolName": "Write",
                    "targetFile": "src/foo.ts",
                    "writeContent": version
                }
            }),
        )
        .await;
    }

    let queue = get(&server, "/api/queue").await;
    let pending = queue["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], "req-1");

    let superseded = queue["recent"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == "req-0")
        .unwrap()
        .clone();
    assert_eq!(superseded["status"], "denied");
    assert_eq!(superseded["resolvedBy"], "auto");
}

#[tokio::test]
async fn test_bulk_resolution() {
    let server = start_server().await;
    for host in ["a.com", "b.com", "c.com"] {
        post(
            &server,
            "/api/queue",
            json!({
                "category": "network",
                "action": format!("CONNECT {}:443", host),
                "description": ""
            }),
        )
        .await;
    }
    post(
        &server,
        "/api/queue",
        json!({"category": "git", "action": "push main", "description": ""}),
    )
    .await;

    let (status, body) = post(
        &server,
        "/api/queue/bulk",
        json!({"category": "network", "status": "denied", "resolvedBy": "cli"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 3);

    let queue = get(&server, "/api/queue").await;
    let pending = queue["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["category"], "git");
}

#[tokio::test]
async fn test_rules_endpoints() {
    let server = start_server().await;

    let (status, body) = post(
        &server,
        "/api/rules",
        json!({"type": "allow", "rule": "network(*.github.com)"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["added"], true);

    // Unparseable rules are rejected.
    let (_, body) = post(
        &server,
        "/api/rules",
        json!({"type": "allow", "rule": "bogus(*)"}),
    )
    .await;
    assert_eq!(body["added"], false);

    // Duplicates are rejected.
    let (_, body) = post(
        &server,
        "/api/rules",
        json!({"type": "allow", "rule": "network(*.github.com)"}),
    )
    .await;
    assert_eq!(body["added"], false);

    let rules = get(&server, "/api/rules").await;
    assert_eq!(rules["allow"].as_array().unwrap().len(), 1);

    let client = reqwest::Client::new();
    let body: Value = client
        .delete(format!("{}/api/rules", server.base_url))
        .json(&json!({"type": "allow", "rule": "network(*.github.com)"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["removed"], true);
    assert!(body["rules"]["allow"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_adding_allow_rule_resolves_matching_pending() {
    let server = start_server().await;
    post(
        &server,
        "/api/queue",
        json!({
            "category": "network",
            "action": "CONNECT api.github.com:443",
            "description": ""
        }),
    )
    .await;

    post(
        &server,
        "/api/rules",
        json!({"type": "allow", "rule": "network(*.github.com)"}),
    )
    .await;

    let queue = get(&server, "/api/queue").await;
    assert!(queue["pending"].as_array().unwrap().is_empty());
    let entry = &queue["recent"].as_array().unwrap()[0];
    assert_eq!(entry["status"], "approved");
    assert_eq!(entry["resolvedBy"], "auto");
}

#[tokio::test]
async fn test_config_get_and_hardened_modes() {
    let server = start_server().await;
    let config = get(&server, "/api/config").await;
    assert_eq!(config["categories"]["exec"]["mode"], "approve-each");
    assert_eq!(config["categories"]["packages"]["mode"], "approve-each");
    assert!(config["rules"]["allow"].as_array().is_some());
}

#[tokio::test]
async fn test_sandbox_proposal_flow() {
    let server = start_server().await;

    let (status, body) = post(
        &server,
        "/api/config/propose",
        json!({
            "path": "categories.network.mode",
            "value": "allow-all",
            "reason": "integration tests need the network"
        }),
    )
    .await;
    assert_eq!(status, 201);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, _) = post(&server, &format!("/api/queue/{}/approve", id), json!({})).await;
    assert_eq!(status, 200);

    let config = get(&server, "/api/config").await;
    assert_eq!(config["categories"]["network"]["mode"], "allow-all");
}

#[tokio::test]
async fn test_stale_edit_conflicts_and_denies() {
    let server = start_server().await;

    post(
        &server,
        "/api/queue",
        json!({
            "category": "filesystem",
            "action": "Edit gone.txt",
            "description": "",
            "metadata": {
                "toolName": "Edit",
                "targetFile": "gone.txt",
                "editContext": {"old_string": "a", "new_string": "b"}
            }
        }),
    )
    .await;

    let (status, body) = post(&server, "/api/queue/req-0/approve", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("stale"));

    let queue = get(&server, "/api/queue").await;
    let entry = &queue["recent"].as_array().unwrap()[0];
    assert_eq!(entry["status"], "denied");
}

#[tokio::test]
async fn test_exec_flow_with_allow_rule() {
    let server = start_server().await;
    server.state.config.add_rule(RuleKind::Allow, "exec(echo *)");

    let (status, body) = post(
        &server,
        "/api/exec",
        json!({"command": "echo from-the-api"}),
    )
    .await;
    assert_eq!(status, 201);
    let id = body["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("exec-auto-"));

    let mut record = Value::Null;
    for _ in 0..100 {
        record = get(&server, &format!("/api/exec/{}", id)).await;
        if record["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(record["status"], "completed");
    assert_eq!(record["stdout"].as_str().unwrap().trim(), "from-the-api");
    assert_eq!(record["exitCode"], 0);
}

#[tokio::test]
async fn test_exec_queued_then_approved() {
    let server = start_server().await;

    let (_, body) = post(&server, "/api/exec", json!({"command": "echo gated"})).await;
    let id = body["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("req-"));

    let record = get(&server, &format!("/api/exec/{}", id)).await;
    assert_eq!(record["status"], "pending");

    post(&server, &format!("/api/queue/{}/approve", id), json!({})).await;

    let mut record = Value::Null;
    for _ in 0..100 {
        record = get(&server, &format!("/api/exec/{}", id)).await;
        if record["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(record["stdout"].as_str().unwrap().trim(), "gated");
}

#[tokio::test]
async fn test_exec_unknown_id_is_404() {
    let server = start_server().await;
    let response = reqwest::get(format!("{}/api/exec/exec-auto-0", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_package_flag_filtering_end_to_end() {
    let server = start_server().await;

    let (status, body) = post(
        &server,
        "/api/packages",
        json!({
            "manager": "npm",
            "packages": ["express"],
            "flags": ["--registry=evil.com", "-D"]
        }),
    )
    .await;
    assert_eq!(status, 201);
    let id = body["id"].as_str().unwrap().to_string();

    let record = get(&server, &format!("/api/packages/{}", id)).await;
    assert_eq!(record["manager"], "npm");
    assert_eq!(record["action"], "install");
    assert_eq!(record["command"], "npm install -D express");
    assert_eq!(record["flags"], json!(["-D"]));

    // The queued action is the flag-free match target.
    let queue = get(&server, "/api/queue").await;
    assert_eq!(queue["pending"][0]["action"], "npm install express");
}

#[tokio::test]
async fn test_package_unknown_manager_is_400() {
    let server = start_server().await;
    let (status, _) = post(
        &server,
        "/api/packages",
        json!({"manager": "apt", "packages": ["vim"]}),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_audit_endpoint_reflects_resolutions() {
    let server = start_server().await;
    post(
        &server,
        "/api/queue",
        json!({"category": "network", "action": "CONNECT a.com:443", "description": ""}),
    )
    .await;
    post(&server, "/api/queue/req-0/approve", json!({"resolvedBy": "cli"})).await;

    // Audit appends are fire-and-forget.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries = get(&server, "/api/audit?limit=10").await;
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], "req-0");
    assert_eq!(entries[0]["decision"], "approved");
    assert_eq!(entries[0]["resolvedBy"], "cli");
}

#[tokio::test]
async fn test_status_endpoint() {
    let server = start_server().await;
    let status = get(&server, "/api/status").await;
    assert!(status["startedAt"].is_i64());
    assert!(status["uptime"].is_u64());
    assert!(status["maxUptimeMs"].is_null());
    assert_eq!(status["pendingCount"], 0);
}

#[tokio::test]
async fn test_sync_files_listing() {
    let server = start_server().await;
    let ws = &server.state.workspace;
    std::fs::create_dir_all(ws.join("src")).unwrap();
    std::fs::create_dir_all(ws.join("node_modules/x")).unwrap();
    std::fs::write(ws.join("src/lib.rs"), "pub fn f() {}").unwrap();
    std::fs::write(ws.join("node_modules/x/i.js"), "x").unwrap();

    let files = get(&server, "/api/sync/files").await;
    let files = files["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "src/lib.rs");
}

// -- WebSocket tests -----------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_ws(server: &TestServer) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(&server.ws_url).await.unwrap();
    ws
}

async fn recv_type(ws: &mut WsStream, expected: &str) -> Value {
    for _ in 0..40 {
        let frame = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
        let frame = match frame {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => panic!("WebSocket receive error: {}", e),
            Ok(None) => panic!("WebSocket closed before receiving {}", expected),
            Err(_) => continue,
        };
        let value: Value = serde_json::from_str(&frame.into_text().unwrap()).unwrap();
        if value["type"].as_str() == Some(expected) {
            return value;
        }
    }
    panic!("timed out waiting for {}", expected);
}

#[tokio::test]
async fn test_ws_init_snapshot() {
    let server = start_server().await;
    post(
        &server,
        "/api/queue",
        json!({"category": "network", "action": "CONNECT a.com:443", "description": ""}),
    )
    .await;

    let mut ws = connect_ws(&server).await;
    let init = recv_type(&mut ws, "init").await;
    assert_eq!(init["data"]["pending"].as_array().unwrap().len(), 1);
    assert!(init["data"]["config"]["categories"].is_object());
    assert!(init["data"]["rules"]["allow"].is_array());
}

#[tokio::test]
async fn test_ws_relays_request_then_resolve() {
    let server = start_server().await;
    let mut ws = connect_ws(&server).await;
    recv_type(&mut ws, "init").await;

    post(
        &server,
        "/api/queue",
        json!({"category": "git", "action": "push main", "description": ""}),
    )
    .await;
    let request = recv_type(&mut ws, "request").await;
    assert_eq!(request["data"]["id"], "req-0");
    assert_eq!(request["data"]["status"], "pending");

    post(&server, "/api/queue/req-0/approve", json!({})).await;
    let resolve = recv_type(&mut ws, "resolve").await;
    assert_eq!(resolve["data"]["id"], "req-0");
    assert_eq!(resolve["data"]["status"], "approved");
}

#[tokio::test]
async fn test_ws_client_approve_command() {
    let server = start_server().await;
    let mut ws = connect_ws(&server).await;
    recv_type(&mut ws, "init").await;

    post(
        &server,
        "/api/queue",
        json!({"category": "network", "action": "CONNECT a.com:443", "description": ""}),
    )
    .await;
    recv_type(&mut ws, "request").await;

    ws.send(tungstenite::Message::text(
        json!({"type": "approve", "id": "req-0", "resolvedBy": "web"}).to_string(),
    ))
    .await
    .unwrap();

    let resolve = recv_type(&mut ws, "resolve").await;
    assert_eq!(resolve["data"]["status"], "approved");
    assert_eq!(resolve["data"]["resolvedBy"], "web");
}

#[tokio::test]
async fn test_ws_rules_broadcast() {
    let server = start_server().await;
    let mut ws = connect_ws(&server).await;
    recv_type(&mut ws, "init").await;

    post(
        &server,
        "/api/rules",
        json!({"type": "deny", "rule": "network(evil.com)"}),
    )
    .await;

    let rules = recv_type(&mut ws, "rules").await;
    assert_eq!(rules["data"]["deny"][0], "network(evil.com)");
}

#[tokio::test]
async fn test_shutdown_sequence_denies_pending_and_broadcasts() {
    let server = start_server().await;
    let mut ws = connect_ws(&server).await;
    recv_type(&mut ws, "init").await;

    post(
        &server,
        "/api/queue",
        json!({"category": "network", "action": "CONNECT a.com:443", "description": ""}),
    )
    .await;
    recv_type(&mut ws, "request").await;

    control::run_shutdown_sequence(&server.state, "test shutdown").await;

    // The pending request was denied as auto...
    let resolve = recv_type(&mut ws, "resolve").await;
    assert_eq!(resolve["data"]["status"], "denied");
    assert_eq!(resolve["data"]["resolvedBy"], "auto");

    // ...and clients heard about the shutdown.
    let shutdown = recv_type(&mut ws, "shutdown").await;
    assert_eq!(shutdown["data"]["reason"], "test shutdown");

    assert!(server.state.queue.pending().is_empty());
}
