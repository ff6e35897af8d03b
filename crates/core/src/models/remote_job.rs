use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent 受保护接口使用的共享密钥请求头
pub const CLUSTER_SECRET_HEADER: &str = "X-Cluster-Secret";

/// Agent 侧任务状态：`running → {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RemoteJobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteJobStatus::Running)
    }

    /// 退出码 0 视为成功
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => RemoteJobStatus::Completed,
            _ => RemoteJobStatus::Failed,
        }
    }
}

/// Agent 上的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: RemoteJobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /execute` 请求体
///
/// `taskId` 由 hub 指定时作为 RemoteJob id，便于先订阅后派发。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// `POST /execute-job` 请求体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJobRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAccepted {
    pub task_id: String,
    pub status: String,
}

impl ExecuteAccepted {
    pub fn started(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: "started".to_string(),
        }
    }
}

/// `GET /tasks` 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<RemoteJob>,
    pub running: u32,
    pub capacity: u32,
}

/// `GET /health` 响应
///
/// 能力字段供主动扫描建立节点记录，旧版本 Agent 可能不返回。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub hostname: String,
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_memory: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_allows_missing_fields() {
        let req: ExecuteRequest = serde_json::from_str(r#"{"args":["-l"]}"#).unwrap();
        assert!(req.command.is_none());
        assert_eq!(req.args, vec!["-l"]);

        let req: ExecuteRequest =
            serde_json::from_str(r#"{"command":"echo","taskId":"abc"}"#).unwrap();
        assert_eq!(req.command.as_deref(), Some("echo"));
        assert_eq!(req.task_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            RemoteJobStatus::from_exit_code(Some(0)),
            RemoteJobStatus::Completed
        );
        assert_eq!(
            RemoteJobStatus::from_exit_code(Some(2)),
            RemoteJobStatus::Failed
        );
        assert_eq!(RemoteJobStatus::from_exit_code(None), RemoteJobStatus::Failed);
        assert!(!RemoteJobStatus::Running.is_terminal());
    }

    #[test]
    fn test_accepted_shape() {
        let json = serde_json::to_value(ExecuteAccepted::started("t1")).unwrap();
        assert_eq!(json, serde_json::json!({"taskId": "t1", "status": "started"}));
    }
}
