use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};

use fleet_discovery::NodeTable;
use fleet_dispatcher::{PlacementStrategy, TaskManager};

use crate::handlers::{health, nodes, queue, tasks};

#[derive(Clone)]
pub struct AppState {
    pub task_manager: TaskManager,
    pub table: Arc<NodeTable>,
    pub placement: Arc<dyn PlacementStrategy>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        task_manager: TaskManager,
        table: Arc<NodeTable>,
        placement: Arc<dyn PlacementStrategy>,
    ) -> Self {
        Self {
            task_manager,
            table,
            placement,
            started_at: Instant::now(),
        }
    }
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/tasks",
            get(tasks::list_tasks).post(tasks::submit_task),
        )
        .route("/api/tasks/{id}", get(tasks::get_task))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/api/nodes", get(nodes::list_nodes))
        .route("/api/nodes/best", get(nodes::best_node))
        .route("/api/queue/stats", get(queue::queue_stats))
        .with_state(state)
}
