use axum::{extract::State, response::IntoResponse};
use serde::Serialize;

use crate::{response::success, routes::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHealth {
    pub status: &'static str,
    pub hostname: String,
    pub node_count: usize,
    pub queue_backend: &'static str,
    pub uptime_seconds: u64,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    success(HubHealth {
        status: "healthy",
        hostname: state.table.local_hostname().to_string(),
        node_count: state.table.len().await,
        queue_backend: state.task_manager.queue_backend(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
