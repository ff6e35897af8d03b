use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeKey;

/// 任务状态
///
/// `pending → queued → running → {completed | failed | cancelled}`，
/// 未进入集群的任务走 `pending → running`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务定义
///
/// 任务由 TaskManager 独占。身份字段创建后不变，
/// 只有状态与结果字段会被当前负责执行的一方修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub target_node_id: Option<NodeKey>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl Task {
    /// 创建新的待调度任务
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        working_directory: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            args,
            working_directory,
            env: HashMap::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            target_node_id: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 进入 queued 并记录目标节点
    pub fn mark_queued(&mut self, node: NodeKey) -> bool {
        if !self.status.can_transition_to(TaskStatus::Queued) {
            return false;
        }
        self.status = TaskStatus::Queued;
        self.target_node_id = Some(node);
        true
    }

    pub fn mark_running(&mut self) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// 终态转换，只有第一次调用生效
    ///
    /// `completedAt` 只在 running 出发的转换中写入；
    /// pending/queued 直接取消时不写。
    pub fn finish(&mut self, status: TaskStatus) -> bool {
        if !status.is_terminal() || !self.status.can_transition_to(status) {
            return false;
        }
        if self.status == TaskStatus::Running {
            let now = Utc::now();
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
        self.status = status;
        true
    }
}

/// 提交选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitOptions {
    pub allow_cluster: bool,
    pub preferred_cluster: Option<NodeKey>,
    pub require_high_power: bool,
    pub env: HashMap<String, String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            allow_cluster: true,
            preferred_cluster: None,
            require_high_power: false,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// TaskManager 对外广播的任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged { task_id: String, status: TaskStatus },
    #[serde(rename_all = "camelCase")]
    Output {
        task_id: String,
        stream: OutputStream,
        data: String,
    },
}

/// 队列统计，持久化后端不可用时全部为 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
