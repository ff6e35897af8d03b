use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_api::{create_app, AppState};
use fleet_config::TaskManagerConfig;
use fleet_core::{DiscoveredVia, NodeCapabilities, NodeStats};
use fleet_discovery::NodeTable;
use fleet_dispatcher::{CapacityScoreStrategy, ClusterManager, TaskManager};
use fleet_infrastructure::DirectWorkQueue;

struct Hub {
    app: Router,
    table: Arc<NodeTable>,
    task_manager: TaskManager,
}

fn hub() -> Hub {
    let table = Arc::new(NodeTable::new("hub"));
    let cluster = Arc::new(ClusterManager::new(
        Arc::clone(&table),
        "secret",
        Duration::from_millis(100),
    ));
    let placement = Arc::new(CapacityScoreStrategy::new());
    let task_manager = TaskManager::new(
        TaskManagerConfig::default(),
        cluster,
        placement.clone(),
        Arc::new(DirectWorkQueue::new()),
    );
    let state = AppState::new(task_manager.clone(), Arc::clone(&table), placement);
    Hub {
        app: create_app(state),
        table,
        task_manager,
    }
}

async fn add_node(table: &NodeTable, hostname: &str, memory_gib: u64, load: f64) {
    table
        .upsert(
            hostname,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            3100,
            NodeCapabilities {
                platform: "linux".into(),
                arch: "x86_64".into(),
                cpu_count: 8,
                total_memory_bytes: memory_gib * 1024 * 1024 * 1024,
            },
            Some(NodeStats {
                load_average_1m: load,
                memory_usage_percent: 20.0,
                max_task_count: Some(4),
                available_slot_count: Some(4),
                ..NodeStats::default()
            }),
            DiscoveredVia::Broadcast,
        )
        .await;
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_reports_hub_state() {
    let hub = hub();
    add_node(&hub.table, "worker-a", 8, 0.5).await;

    let (status, body) = call(&hub.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["hostname"], "hub");
    assert_eq!(body["data"]["nodeCount"], 1);
    assert_eq!(body["data"]["queueBackend"], "direct");
}

#[tokio::test]
async fn test_submit_rejects_empty_command() {
    let hub = hub();
    let (status, body) = call(&hub.app, "POST", "/api/tasks", Some(json!({"command": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["type"], "INVALID_PARAMS");
}

#[cfg(unix)]
#[tokio::test]
async fn test_submit_local_task_and_query() {
    let hub = hub();
    let (status, body) = call(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(json!({"command": "echo", "args": ["hello"], "allowCluster": false})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let task = hub
        .task_manager
        .wait(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(task.stdout.trim(), "hello");

    let (status, body) = call(&hub.app, "GET", &format!("/api/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["exitCode"], 0);

    let (status, body) = call(&hub.app, "GET", "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = call(&hub.app, "POST", &format!("/api/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "NOTHING_TO_CANCEL");
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let hub = hub();
    let (status, _) = call(&hub.app, "GET", "/api/tasks/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = call(&hub.app, "POST", "/api/tasks/missing/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_nodes_listing_and_best_node() {
    let hub = hub();
    let (status, _) = call(&hub.app, "GET", "/api/nodes/best", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    add_node(&hub.table, "busy", 32, 6.0).await;
    add_node(&hub.table, "idle", 8, 0.0).await;

    let (status, body) = call(&hub.app, "GET", "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = body["data"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["id"], "busy:3100");
    assert_eq!(nodes[0]["highPower"], true);
    assert!(nodes[0]["score"].as_f64().is_some());

    let (_, body) = call(&hub.app, "GET", "/api/nodes/best", None).await;
    assert_eq!(body["data"]["id"], "idle:3100");

    let (_, body) = call(&hub.app, "GET", "/api/nodes/best?high_power=true", None).await;
    assert_eq!(body["data"]["id"], "busy:3100");
}

#[tokio::test]
async fn test_queue_stats_for_direct_backend() {
    let hub = hub();
    let (status, body) = call(&hub.app, "GET", "/api/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["backend"], "direct");
    assert_eq!(body["data"]["waiting"], 0);
    assert_eq!(body["data"]["failed"], 0);
}
