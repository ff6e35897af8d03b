use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;

use fleet_core::SubmitOptions;

use crate::{
    error::{ApiError, ApiResult},
    response::{accepted, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(flatten)]
    pub options: SubmitOptions,
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_manager
        .submit(&request.command, request.args, request.cwd, request.options)
        .await?;
    info!(
        task_id = %task.id,
        target = ?task.target_node_id.as_ref().map(ToString::to_string),
        "已接受任务提交"
    );
    Ok(accepted(task))
}

pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    success(state.task_manager.list().await)
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_manager
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("任务 {id}")))?;
    Ok(success(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.task_manager.cancel(&id).await?;
    Ok(success(task))
}
