use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{NodeKey, QueueStats, Task};
use fleet_errors::{FleetError, FleetResult};

/// 排队等待远程派发的作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub task_id: String,
    pub node_id: NodeKey,
    #[serde(default)]
    pub attempt: u32,
    /// 入队时的任务快照，hub 重启后据此恢复任务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl QueuedJob {
    pub fn new(task_id: impl Into<String>, node_id: NodeKey) -> Self {
        Self {
            task_id: task_id.into(),
            node_id,
            attempt: 0,
            task: None,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }
}

/// 作业处理器，由队列在取到作业时回调
///
/// `process` 返回错误表示本次尝试失败，队列可以按自身策略重试；
/// 重试用尽（或队列不支持重试）时调用 `on_exhausted`。
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &QueuedJob) -> FleetResult<()>;

    async fn on_exhausted(&self, _job: &QueuedJob, _error: FleetError) {}
}

/// 工作队列抽象
///
/// 持久化实现提供重试与崩溃恢复；直接执行实现在入队时立即处理。
/// 调用方不需要知道当前使用的是哪一种。
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// 绑定处理器并开始消费，直到收到关闭信号
    async fn start(
        &self,
        processor: Arc<dyn JobProcessor>,
        shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()>;

    /// 提交作业
    async fn enqueue(&self, job: QueuedJob) -> FleetResult<()>;

    /// 队列统计
    async fn stats(&self) -> FleetResult<QueueStats>;

    fn backend_name(&self) -> &'static str;

    fn is_durable(&self) -> bool;
}
