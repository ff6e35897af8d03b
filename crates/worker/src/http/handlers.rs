use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use fleet_core::{
    ExecuteAccepted, ExecuteJobRequest, ExecuteRequest, HealthResponse, NodeStats, RemoteJob,
    StreamMessage, TaskListResponse,
};

use super::error::{AgentError, AgentResult};
use super::routes::AgentState;

pub async fn health(State(state): State<AgentState>) -> Json<HealthResponse> {
    let caps = state.stats.capabilities();
    Json(HealthResponse {
        status: "ok".to_string(),
        hostname: state.stats.hostname(),
        uptime: state.started_at.elapsed().as_secs(),
        platform: Some(caps.platform),
        arch: Some(caps.arch),
        cpus: Some(caps.cpu_count),
        total_memory: Some(caps.total_memory_bytes),
    })
}

pub async fn stats(State(state): State<AgentState>) -> Json<NodeStats> {
    Json(state.stats.stats())
}

pub async fn execute(
    State(state): State<AgentState>,
    Json(request): Json<ExecuteRequest>,
) -> AgentResult<(StatusCode, Json<ExecuteAccepted>)> {
    let accepted = state.jobs.execute(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn execute_job(
    State(state): State<AgentState>,
    Json(request): Json<ExecuteJobRequest>,
) -> AgentResult<(StatusCode, Json<ExecuteAccepted>)> {
    let accepted = state.jobs.execute_job(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn get_task(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> AgentResult<Json<RemoteJob>> {
    state
        .jobs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AgentError::NotFound(format!("任务 {id}")))
}

pub async fn list_tasks(State(state): State<AgentState>) -> Json<TaskListResponse> {
    Json(state.jobs.list().await)
}

pub async fn cancel_task(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> AgentResult<impl IntoResponse> {
    state.jobs.cancel(&id).await?;
    Ok(Json(json!({ "taskId": id, "status": "cancelling" })))
}

/// 流式通道：把所有作业事件推送给连接方
pub async fn stream(State(state): State<AgentState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let updates = state.jobs.subscribe();
    ws.on_upgrade(move |socket| forward_updates(socket, updates))
}

async fn forward_updates(mut socket: WebSocket, mut updates: broadcast::Receiver<fleet_core::TaskUpdate>) {
    debug!("流式订阅者已连接");
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let text = match StreamMessage::TaskUpdate(update).to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("序列化流事件失败: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("流式订阅者处理过慢，丢弃 {skipped} 条事件");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // 入站消息不需要处理
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("流式订阅者已断开");
}
