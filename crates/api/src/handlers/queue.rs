use axum::{extract::State, response::IntoResponse};
use serde::Serialize;

use fleet_core::QueueStats;

use crate::{response::success, routes::AppState};

#[derive(Debug, Serialize)]
pub struct QueueStatsView {
    pub backend: &'static str,
    #[serde(flatten)]
    pub stats: QueueStats,
}

pub async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    success(QueueStatsView {
        backend: state.task_manager.queue_backend(),
        stats: state.task_manager.queue_stats().await,
    })
}
