use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fleet_core::{
    ExecuteRequest, JobProcessor, OutputStream, QueuedJob, RemoteJob, Task, TaskStatus,
    TaskUpdate, TaskUpdateEvent,
};
use fleet_errors::{FleetError, FleetResult};

use crate::cluster_manager::{ClusterManager, Subscription};
use crate::task_manager::{TaskManagerInner, TaskResult};

/// 远程作业处理器
///
/// 从队列取出作业后派发到目标节点，然后通过流式订阅跟踪执行，
/// 并定期轮询节点上的任务快照，防止流式连接断开时漏掉结束事件。
pub struct RemoteJobProcessor {
    inner: Arc<TaskManagerInner>,
}

enum WaitOutcome {
    Finished,
    Cancelled,
}

impl RemoteJobProcessor {
    pub(crate) fn new(inner: Arc<TaskManagerInner>) -> Self {
        Self { inner }
    }

    fn cluster(&self) -> &Arc<ClusterManager> {
        &self.inner.cluster
    }

    /// 不经过队列直接处理一个作业
    pub async fn process_now(&self, job: QueuedJob) {
        if let Err(e) = self.process(&job).await {
            self.on_exhausted(&job, e).await;
        }
    }

    async fn subscribe_and_dispatch(
        &self,
        job: &QueuedJob,
        task: &Task,
    ) -> FleetResult<(String, Subscription)> {
        let cluster = self.cluster();
        // 先订阅再派发，避免丢失最早的输出
        let mut subscription = cluster.subscribe(job.node_id.clone(), &task.id).await;
        if !cluster.is_connected(&job.node_id).await {
            debug!(node = %job.node_id, "流式连接尚未建立，依赖轮询获取结果");
        }

        let request = ExecuteRequest {
            command: Some(task.command.clone()),
            args: task.args.clone(),
            cwd: task.working_directory.clone(),
            env: task.env.clone(),
            task_id: Some(task.id.clone()),
        };
        let accepted = match cluster.dispatch(&job.node_id, &request).await {
            Ok(accepted) => accepted,
            Err(e) => {
                cluster.unsubscribe(&subscription.key, subscription.id).await;
                return Err(e);
            }
        };

        if accepted.task_id != task.id {
            debug!(task_id = %task.id, remote_id = %accepted.task_id, "节点使用了自己的任务ID");
            cluster.unsubscribe(&subscription.key, subscription.id).await;
            subscription = cluster
                .subscribe(job.node_id.clone(), &accepted.task_id)
                .await;
        }
        Ok((accepted.task_id, subscription))
    }

    /// 处理一条流式事件，返回是否已进入终态
    async fn apply_update(
        &self,
        job: &QueuedJob,
        task_id: &str,
        remote_id: &str,
        update: TaskUpdate,
    ) -> bool {
        if update.event.is_terminal() {
            // 流式输出可能不完整，以节点快照为准
            match self.cluster().fetch_job(&job.node_id, remote_id).await {
                Ok(Some(snapshot)) if snapshot.status.is_terminal() => {
                    return self.apply_snapshot(task_id, snapshot).await;
                }
                Ok(_) => debug!(task_id = %task_id, "节点快照尚未结束，按流式事件结束任务"),
                Err(e) => debug!(task_id = %task_id, "读取远程任务快照失败: {e}"),
            }
            self.finish_from_update(task_id, update).await;
            return true;
        }

        let stream = match update.event {
            TaskUpdateEvent::Error => OutputStream::Stderr,
            _ => OutputStream::Stdout,
        };
        if let Some(text) = update.text() {
            self.inner.append_output(task_id, stream, text).await;
            self.inner.emit_output(task_id, stream, text.to_string());
        }
        false
    }

    /// 仅凭流式终态事件结束任务
    async fn finish_from_update(&self, task_id: &str, update: TaskUpdate) {
        let exit_code = update.exit_code();
        let (status, error) = match (update.event, exit_code) {
            (TaskUpdateEvent::Cancelled, _) => (TaskStatus::Cancelled, None),
            (TaskUpdateEvent::Completed, Some(0) | None) => (TaskStatus::Completed, None),
            (_, code) => (
                TaskStatus::Failed,
                Some(
                    update
                        .data
                        .get("error")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("远程命令执行失败，退出码: {code:?}")),
                ),
            ),
        };
        self.inner
            .finish(
                task_id,
                status,
                TaskResult {
                    exit_code,
                    error,
                    ..TaskResult::default()
                },
            )
            .await;
    }

    /// 根据节点快照结束任务，返回是否已进入终态
    async fn apply_snapshot(&self, task_id: &str, job: RemoteJob) -> bool {
        use fleet_core::RemoteJobStatus;

        let status = match job.status {
            RemoteJobStatus::Running => return false,
            RemoteJobStatus::Completed => TaskStatus::Completed,
            RemoteJobStatus::Failed => TaskStatus::Failed,
            RemoteJobStatus::Cancelled => TaskStatus::Cancelled,
        };
        let error = match status {
            TaskStatus::Failed => job
                .error
                .or_else(|| Some(format!("远程命令执行失败，退出码: {:?}", job.exit_code))),
            _ => None,
        };
        self.inner
            .finish(
                task_id,
                status,
                TaskResult {
                    exit_code: job.exit_code,
                    stdout: Some(job.stdout),
                    stderr: Some(job.stderr),
                    error,
                },
            )
            .await;
        true
    }

    async fn follow(
        &self,
        job: &QueuedJob,
        task_id: &str,
        remote_id: &str,
        subscription: &mut Subscription,
        mut cancel: oneshot::Receiver<()>,
    ) -> WaitOutcome {
        let config = &self.inner.config;
        let deadline = Instant::now() + Duration::from_secs(config.job_wait_timeout_seconds);
        let mut poll = tokio::time::interval(Duration::from_millis(config.remote_poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即触发，跳过
        poll.tick().await;
        let mut streaming = true;

        loop {
            tokio::select! {
                update = subscription.receiver.recv(), if streaming => match update {
                    Some(update) => {
                        if self.apply_update(job, task_id, remote_id, update).await {
                            return WaitOutcome::Finished;
                        }
                    }
                    // 订阅被移除，只依赖轮询
                    None => streaming = false,
                },
                _ = poll.tick() => {
                    match self.cluster().fetch_job(&job.node_id, remote_id).await {
                        Ok(Some(snapshot)) => {
                            if self.apply_snapshot(task_id, snapshot).await {
                                return WaitOutcome::Finished;
                            }
                        }
                        Ok(None) => {
                            warn!(task_id = %task_id, node = %job.node_id, "节点上找不到任务");
                            self.inner
                                .finish(
                                    task_id,
                                    TaskStatus::Failed,
                                    TaskResult {
                                        error: Some(format!("节点 {} 上的任务已丢失", job.node_id)),
                                        ..TaskResult::default()
                                    },
                                )
                                .await;
                            return WaitOutcome::Finished;
                        }
                        Err(e) => debug!(task_id = %task_id, "轮询远程任务失败: {e}"),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(task_id = %task_id, node = %job.node_id, "等待远程任务超时");
                    if let Err(e) = self.cluster().cancel_job(&job.node_id, remote_id).await {
                        debug!(task_id = %task_id, "超时后取消远程任务失败: {e}");
                    }
                    self.inner
                        .finish(
                            task_id,
                            TaskStatus::Failed,
                            TaskResult {
                                error: Some(format!(
                                    "等待远程任务超时（{}秒）",
                                    config.job_wait_timeout_seconds
                                )),
                                ..TaskResult::default()
                            },
                        )
                        .await;
                    return WaitOutcome::Finished;
                }
                result = &mut cancel => {
                    if result.is_ok() {
                        return WaitOutcome::Cancelled;
                    }
                    // 发送端被丢弃说明任务已由其他路径结束
                    return WaitOutcome::Finished;
                }
            }
        }
    }
}

#[async_trait]
impl JobProcessor for RemoteJobProcessor {
    async fn process(&self, job: &QueuedJob) -> FleetResult<()> {
        let task = match self.inner.task(&job.task_id).await {
            Some(task) if task.status == TaskStatus::Queued => task,
            Some(task) => {
                debug!(task_id = %task.id, status = %task.status, "任务不再排队，跳过");
                return Ok(());
            }
            None => match self.inner.restore(job).await {
                Some(task) => task,
                None => {
                    debug!(task_id = %job.task_id, "任务不存在，跳过");
                    return Ok(());
                }
            },
        };

        info!(task_id = %task.id, node = %job.node_id, attempt = job.attempt, "派发任务到节点");
        let (remote_id, mut subscription) = match self.subscribe_and_dispatch(job, &task).await {
            Ok(dispatched) => dispatched,
            Err(FleetError::Authorization(message)) => {
                // 密钥错误重试无意义
                self.inner.fail(&task.id, message).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let cancel = self.inner.register_cancel(&task.id).await;
        if !self.inner.mark_running(&task.id).await {
            // 派发期间任务已被取消
            if let Err(e) = self.cluster().cancel_job(&job.node_id, &remote_id).await {
                debug!(task_id = %task.id, "取消远程任务失败: {e}");
            }
            self.cluster()
                .unsubscribe(&subscription.key, subscription.id)
                .await;
            return Ok(());
        }

        let outcome = self
            .follow(job, &task.id, &remote_id, &mut subscription, cancel)
            .await;
        self.cluster()
            .unsubscribe(&subscription.key, subscription.id)
            .await;

        if let WaitOutcome::Cancelled = outcome {
            debug!(task_id = %task.id, "远程任务等待被取消");
        }
        Ok(())
    }

    async fn on_exhausted(&self, job: &QueuedJob, error: FleetError) {
        warn!(task_id = %job.task_id, node = %job.node_id, "远程派发失败: {error}");
        self.inner
            .fail(&job.task_id, format!("派发到节点 {} 失败: {error}", job.node_id))
            .await;
    }
}
