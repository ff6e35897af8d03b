use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use fleet_core::StatsProvider;

use super::handlers::{
    cancel_task, execute, execute_job, get_task, health, list_tasks, stats, stream,
};
use super::middleware::require_secret;
use crate::executor::JobManager;

/// Agent HTTP 服务状态
#[derive(Clone)]
pub struct AgentState {
    pub jobs: Arc<JobManager>,
    pub stats: Arc<dyn StatsProvider>,
    pub secret: Arc<str>,
    pub started_at: Instant,
}

impl AgentState {
    pub fn new(jobs: Arc<JobManager>, stats: Arc<dyn StatsProvider>, secret: &str) -> Self {
        Self {
            jobs,
            stats,
            secret: Arc::from(secret),
            started_at: Instant::now(),
        }
    }
}

/// 创建 Agent 路由
///
/// `/health`、`/stats` 与 `/ws` 不校验密钥，其余接口要求 X-Cluster-Secret。
pub fn create_routes(state: AgentState) -> Router {
    let protected = Router::new()
        .route("/execute", post(execute))
        .route("/execute-job", post(execute_job))
        .route("/task/{id}", get(get_task))
        .route("/task/{id}/cancel", post(cancel_task))
        .route("/tasks", get(list_tasks))
        .route_layer(from_fn_with_state(state.clone(), require_secret));

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws", get(stream))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
