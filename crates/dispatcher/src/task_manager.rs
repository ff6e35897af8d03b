use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use fleet_config::TaskManagerConfig;
use fleet_core::{
    NodeKey, OutputStream, QueueStats, QueuedJob, SubmitOptions, Task, TaskEvent, TaskStatus,
    WorkQueue,
};
use fleet_discovery::NodeTable;
use fleet_errors::{FleetError, FleetResult};
use fleet_infrastructure::{run_process, OutputChunk, ProcessOutcome, ProcessSpec, Termination};

use crate::cluster_manager::ClusterManager;
use crate::placement::{PlacementRequest, PlacementStrategy};
use crate::remote::RemoteJobProcessor;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 任务执行结果，在终态转换时写入任务
#[derive(Debug, Default)]
pub(crate) struct TaskResult {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

pub(crate) struct TaskManagerInner {
    pub config: TaskManagerConfig,
    pub tasks: RwLock<HashMap<String, Task>>,
    pub table: Arc<NodeTable>,
    pub cluster: Arc<ClusterManager>,
    pub placement: Arc<dyn PlacementStrategy>,
    pub queue: Arc<dyn WorkQueue>,
    pub events: broadcast::Sender<TaskEvent>,
    /// 执行中任务的取消信号（本地进程或远程等待）
    pub cancels: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl TaskManagerInner {
    pub async fn task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, task_id: &str, status: TaskStatus) {
        self.emit(TaskEvent::StatusChanged {
            task_id: task_id.to_string(),
            status,
        });
    }

    pub fn emit_output(&self, task_id: &str, stream: OutputStream, data: String) {
        self.emit(TaskEvent::Output {
            task_id: task_id.to_string(),
            stream,
            data,
        });
    }

    pub async fn mark_running(&self, id: &str) -> bool {
        let changed = match self.tasks.write().await.get_mut(id) {
            Some(task) => task.mark_running(),
            None => false,
        };
        if changed {
            self.emit_status(id, TaskStatus::Running);
        }
        changed
    }

    /// 追加流式输出
    pub async fn append_output(&self, id: &str, stream: OutputStream, data: &str) {
        if let Some(task) = self.tasks.write().await.get_mut(id) {
            if task.is_terminal() {
                return;
            }
            match stream {
                OutputStream::Stdout => task.stdout.push_str(data),
                OutputStream::Stderr => task.stderr.push_str(data),
            }
        }
    }

    /// 终态转换；同一任务只有第一次调用生效，返回是否生效
    pub async fn finish(&self, id: &str, status: TaskStatus, result: TaskResult) -> bool {
        let finished = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(id) {
                Some(task) => {
                    if task.finish(status) {
                        if result.exit_code.is_some() {
                            task.exit_code = result.exit_code;
                        }
                        if let Some(stdout) = result.stdout {
                            task.stdout = stdout;
                        }
                        if let Some(stderr) = result.stderr {
                            task.stderr = stderr;
                        }
                        if result.error.is_some() {
                            task.error = result.error;
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if finished {
            self.cancels.lock().await.remove(id);
            info!(task_id = %id, status = %status, "任务结束");
            counter!("fleet_tasks_finished_total", "status" => status.as_str()).increment(1);
            self.prune_finished().await;
            self.emit_status(id, status);
        }
        finished
    }

    /// 超出保留数量时移除最早结束的任务
    async fn prune_finished(&self) {
        let limit = self.config.max_finished_tasks.max(1);
        let mut tasks = self.tasks.write().await;
        let mut finished: Vec<_> = tasks
            .values()
            .filter(|task| task.is_terminal())
            .map(|task| (task.completed_at.unwrap_or(task.created_at), task.id.clone()))
            .collect();
        if finished.len() <= limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
        }
        debug!(removed = excess, "清理已结束的任务记录");
    }

    /// 从持久化队列的作业快照中恢复任务（hub 重启后内存中已没有该任务）
    pub async fn restore(&self, job: &QueuedJob) -> Option<Task> {
        let snapshot = job.task.clone()?;
        if snapshot.id != job.task_id || snapshot.status != TaskStatus::Queued {
            return None;
        }
        let restored = {
            let mut tasks = self.tasks.write().await;
            tasks
                .entry(snapshot.id.clone())
                .or_insert(snapshot)
                .clone()
        };
        if restored.status != TaskStatus::Queued {
            return None;
        }
        info!(task_id = %restored.id, node = %job.node_id, "从持久化队列恢复任务");
        self.emit_status(&restored.id, restored.status);
        Some(restored)
    }

    /// 进入 running 后立即以失败结束
    pub async fn fail(&self, id: &str, error: String) -> bool {
        self.mark_running(id).await;
        self.finish(
            id,
            TaskStatus::Failed,
            TaskResult {
                error: Some(error),
                ..TaskResult::default()
            },
        )
        .await
    }

    pub async fn register_cancel(&self, id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.cancels.lock().await.insert(id.to_string(), tx);
        rx
    }

    /// 本地执行
    pub async fn run_local(self: Arc<Self>, task: Task) {
        let cancel = self.register_cancel(&task.id).await;
        // 注册前已被取消
        if self.task(&task.id).await.map(|t| t.is_terminal()).unwrap_or(true) {
            return;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<OutputChunk>();
        let spec = ProcessSpec {
            program: task.command.clone(),
            args: task.args.clone(),
            cwd: task.working_directory.as_ref().map(PathBuf::from),
            env: task.env.clone(),
            timeout: Some(Duration::from_secs(self.config.command_timeout_seconds)),
            ..ProcessSpec::new(task.command.clone(), task.args.clone())
        };

        let forward = {
            let inner = Arc::clone(&self);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    inner.emit_output(&task_id, chunk.stream, chunk.data);
                }
            })
        };

        let outcome = run_process(spec, Some(tx), cancel).await;
        let _ = forward.await;

        match outcome {
            Ok(outcome) => self.finish_local(&task.id, outcome).await,
            Err(e) => {
                warn!(task_id = %task.id, "本地任务启动失败: {e}");
                self.finish(
                    &task.id,
                    TaskStatus::Failed,
                    TaskResult {
                        stderr: Some(e.to_string()),
                        error: Some(e.to_string()),
                        ..TaskResult::default()
                    },
                )
                .await;
            }
        }
    }

    async fn finish_local(&self, id: &str, outcome: ProcessOutcome) {
        let (status, error) = match outcome.termination {
            Termination::Exited if outcome.success() => (TaskStatus::Completed, None),
            Termination::Exited => (
                TaskStatus::Failed,
                Some(format!("命令执行失败，退出码: {:?}", outcome.exit_code)),
            ),
            Termination::TimedOut => (
                TaskStatus::Failed,
                Some(format!(
                    "命令执行超时（{}秒）",
                    self.config.command_timeout_seconds
                )),
            ),
            Termination::Cancelled => (TaskStatus::Cancelled, None),
        };
        self.finish(
            id,
            status,
            TaskResult {
                exit_code: outcome.exit_code,
                stdout: Some(outcome.stdout),
                stderr: Some(outcome.stderr),
                error,
            },
        )
        .await;
    }
}

/// 任务管理器
///
/// "在某处执行这条命令"的统一入口，对调用方隐藏本地与远程执行的差别。
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        cluster: Arc<ClusterManager>,
        placement: Arc<dyn PlacementStrategy>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TaskManagerInner {
                config,
                tasks: RwLock::new(HashMap::new()),
                table: Arc::clone(cluster.table()),
                cluster,
                placement,
                queue,
                events,
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 启动队列消费
    pub async fn start(&self, shutdown: broadcast::Receiver<()>) -> FleetResult<()> {
        let processor = Arc::new(RemoteJobProcessor::new(Arc::clone(&self.inner)));
        info!("任务队列后端: {}", self.inner.queue.backend_name());
        self.inner.queue.start(processor, shutdown).await
    }

    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue_backend(&self) -> &'static str {
        self.inner.queue.backend_name()
    }

    /// 提交任务
    pub async fn submit(
        &self,
        command: &str,
        args: Vec<String>,
        cwd: Option<String>,
        options: SubmitOptions,
    ) -> FleetResult<Task> {
        if command.trim().is_empty() {
            return Err(FleetError::invalid_params("command 不能为空"));
        }

        let target = if options.allow_cluster {
            let nodes = self.inner.table.nodes().await;
            let request = PlacementRequest {
                require_high_power: options.require_high_power,
                preferred: options.preferred_cluster.clone(),
            };
            self.inner.placement.select_node(&nodes, &request)
        } else {
            None
        };

        if target.is_none() && !self.inner.config.allow_local {
            return Err(FleetError::CapacityExceeded(
                "没有可用的集群节点，且本地执行已禁用".to_string(),
            ));
        }

        let task = Task::new(command, args, cwd).with_env(options.env);
        let id = task.id.clone();
        self.inner.tasks.write().await.insert(id.clone(), task.clone());
        counter!("fleet_tasks_submitted_total").increment(1);
        self.inner.emit_status(&id, TaskStatus::Pending);

        match target {
            Some(node) => self.enqueue_remote(&id, node).await,
            None => {
                self.inner.mark_running(&id).await;
                info!(task_id = %id, command = %command, "本地执行任务");
                let inner = Arc::clone(&self.inner);
                let snapshot = self.inner.task(&id).await.unwrap_or(task);
                tokio::spawn(inner.run_local(snapshot));
            }
        }

        self.inner
            .task(&id)
            .await
            .ok_or_else(|| FleetError::task_not_found(&id))
    }

    async fn enqueue_remote(&self, id: &str, node: NodeKey) {
        let snapshot = match self.inner.tasks.write().await.get_mut(id) {
            Some(task) => task.mark_queued(node.clone()).then(|| task.clone()),
            None => None,
        };
        let Some(snapshot) = snapshot else {
            return;
        };
        self.inner.emit_status(id, TaskStatus::Queued);
        info!(task_id = %id, node = %node, "任务排队等待远程执行");

        let job = QueuedJob::new(id, node).with_task(snapshot);
        if let Err(e) = self.inner.queue.enqueue(job.clone()).await {
            // 队列写入失败时在进程内直接处理
            warn!(task_id = %id, "入队失败，直接执行: {e}");
            let processor = RemoteJobProcessor::new(Arc::clone(&self.inner));
            tokio::spawn(async move { processor.process_now(job).await });
        }
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.task(id).await
    }

    /// 按创建时间排序的全部任务
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// 取消任务
    ///
    /// 未开始的任务直接转为 cancelled；执行中的任务终止本地进程或通知远程节点。
    pub async fn cancel(&self, id: &str) -> FleetResult<Task> {
        let task = self
            .inner
            .task(id)
            .await
            .ok_or_else(|| FleetError::task_not_found(id))?;

        if task.is_terminal() {
            return Err(FleetError::NothingToCancel(format!(
                "任务 {id} 已处于 {} 状态",
                task.status
            )));
        }

        if task.status == TaskStatus::Running {
            if let Some(node) = &task.target_node_id {
                match self.inner.cluster.cancel_job(node, id).await {
                    Ok(()) => debug!(task_id = %id, node = %node, "已通知远程节点取消"),
                    Err(e) => warn!(task_id = %id, node = %node, "通知远程节点取消失败: {e}"),
                }
            }
            if let Some(signal) = self.inner.cancels.lock().await.remove(id) {
                let _ = signal.send(());
            }
        }

        if !self
            .inner
            .finish(id, TaskStatus::Cancelled, TaskResult::default())
            .await
        {
            let current = self.inner.task(id).await;
            return Err(FleetError::NothingToCancel(format!(
                "任务 {id} 已结束: {}",
                current.map(|t| t.status.to_string()).unwrap_or_default()
            )));
        }

        self.inner
            .task(id)
            .await
            .ok_or_else(|| FleetError::task_not_found(id))
    }

    /// 等待任务进入终态
    pub async fn wait(&self, id: &str, timeout: Duration) -> FleetResult<Task> {
        let mut events = self.inner.events.subscribe();
        let waiting = async {
            loop {
                match self.inner.task(id).await {
                    Some(task) if task.is_terminal() => return Ok(task),
                    Some(_) => {}
                    None => return Err(FleetError::task_not_found(id)),
                }
                loop {
                    match events.recv().await {
                        Ok(TaskEvent::StatusChanged { task_id, status })
                            if task_id == id && status.is_terminal() =>
                        {
                            break
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(FleetError::Internal("任务事件通道已关闭".to_string()))
                        }
                    }
                }
            }
        };

        tokio::time::timeout(timeout, waiting)
            .await
            .map_err(|_| FleetError::Timeout(format!("等待任务 {id} 超时")))?
    }

    /// 队列统计；后端出错时返回全 0
    pub async fn queue_stats(&self) -> QueueStats {
        match self.inner.queue.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("读取队列统计失败: {e}");
                QueueStats::default()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::placement::CapacityScoreStrategy;
    use fleet_discovery::NodeTable;
    use fleet_infrastructure::DirectWorkQueue;

    fn manager_with(config: TaskManagerConfig) -> TaskManager {
        let table = Arc::new(NodeTable::new("hub"));
        let cluster = Arc::new(ClusterManager::new(
            table,
            "secret",
            Duration::from_millis(50),
        ));
        TaskManager::new(
            config,
            cluster,
            Arc::new(CapacityScoreStrategy::new()),
            Arc::new(DirectWorkQueue::new()),
        )
    }

    fn manager() -> TaskManager {
        manager_with(TaskManagerConfig::default())
    }

    fn local_only() -> SubmitOptions {
        SubmitOptions {
            allow_cluster: false,
            ..SubmitOptions::default()
        }
    }

    #[tokio::test]
    async fn test_local_task_completes_with_output() {
        let manager = manager();
        let task = manager
            .submit("echo", vec!["hello".into()], None, local_only())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.target_node_id.is_none());

        let done = manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.stdout.trim(), "hello");
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let manager = manager();
        let task = manager
            .submit("false", vec![], None, local_only())
            .await
            .unwrap();
        let done = manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_ne!(done.exit_code, Some(0));
        assert!(done.error.is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_task() {
        let manager = manager();
        let task = manager
            .submit("definitely-not-a-real-binary-xyz", vec![], None, local_only())
            .await
            .unwrap();
        let done = manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(!done.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_local_timeout_fails_task() {
        let manager = manager_with(TaskManagerConfig {
            command_timeout_seconds: 1,
            ..TaskManagerConfig::default()
        });
        let task = manager
            .submit("sleep", vec!["10".into()], None, local_only())
            .await
            .unwrap();
        let done = manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("超时"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let manager = manager();
        let result = manager.submit("  ", vec![], None, local_only()).await;
        assert!(matches!(result, Err(FleetError::InvalidParams(_))));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_node_and_local_disabled_is_capacity_error() {
        let manager = manager_with(TaskManagerConfig {
            allow_local: false,
            ..TaskManagerConfig::default()
        });
        let result = manager
            .submit("echo", vec![], None, SubmitOptions::default())
            .await;
        assert!(matches!(result, Err(FleetError::CapacityExceeded(_))));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_local_task() {
        let manager = manager();
        let mut events = manager.events();
        let task = manager
            .submit("sleep", vec!["10".into()], None, local_only())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled = manager.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // 进程退出后状态不再变化
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = manager.get(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);

        let mut terminal_events = 0;
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::StatusChanged { status, .. } = event {
                if status.is_terminal() {
                    terminal_events += 1;
                }
            }
        }
        assert_eq!(terminal_events, 1);
    }

    #[tokio::test]
    async fn test_cancel_finished_task_is_nothing_to_cancel() {
        let manager = manager();
        let task = manager
            .submit("true", vec![], None, local_only())
            .await
            .unwrap();
        manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();

        let result = manager.cancel(&task.id).await;
        assert!(matches!(result, Err(FleetError::NothingToCancel(_))));
        assert_eq!(
            manager.get(&task.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let manager = manager();
        assert!(matches!(
            manager.cancel("missing").await,
            Err(FleetError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_output_events_are_streamed() {
        let manager = manager();
        let mut events = manager.events();
        let task = manager
            .submit("echo", vec!["streamed".into()], None, local_only())
            .await
            .unwrap();
        manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();

        let mut output = String::new();
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::Output { task_id, stream, data } = event {
                assert_eq!(task_id, task.id);
                assert_eq!(stream, OutputStream::Stdout);
                output.push_str(&data);
            }
        }
        assert_eq!(output.trim(), "streamed");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let manager = manager();
        let task = manager
            .submit("sleep", vec!["5".into()], None, local_only())
            .await
            .unwrap();
        let result = manager.wait(&task.id, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(FleetError::Timeout(_))));
        manager.cancel(&task.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let manager = manager();
        let first = manager
            .submit("true", vec![], None, local_only())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager
            .submit("true", vec![], None, local_only())
            .await
            .unwrap();
        let ids: Vec<String> = manager.list().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_direct_queue_stats_are_zero() {
        let manager = manager();
        assert_eq!(manager.queue_stats().await, QueueStats::default());
        assert_eq!(manager.queue_backend(), "direct");
    }

    #[tokio::test]
    async fn test_cancel_racing_natural_exit_has_single_outcome() {
        let manager = manager();
        let mut events = manager.events();
        for _ in 0..20 {
            let task = manager
                .submit("true", vec![], None, local_only())
                .await
                .unwrap();
            let cancelled = manager.cancel(&task.id).await;
            let done = manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();

            match cancelled {
                Ok(snapshot) => {
                    assert_eq!(snapshot.status, TaskStatus::Cancelled);
                    assert_eq!(done.status, TaskStatus::Cancelled);
                }
                Err(FleetError::NothingToCancel(_)) => {
                    assert_eq!(done.status, TaskStatus::Completed)
                }
                Err(other) => panic!("unexpected error {other}"),
            }

            // 给可能迟到的第二次转换留出时间
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut terminal = 0;
            while let Ok(event) = events.try_recv() {
                if let TaskEvent::StatusChanged { task_id, status } = event {
                    if task_id == task.id && status.is_terminal() {
                        terminal += 1;
                    }
                }
            }
            assert_eq!(terminal, 1);
            assert_eq!(manager.get(&task.id).await.unwrap().status, done.status);
        }
    }

    #[tokio::test]
    async fn test_finished_tasks_are_pruned_beyond_retention() {
        let manager = manager_with(TaskManagerConfig {
            max_finished_tasks: 2,
            ..TaskManagerConfig::default()
        });
        let mut ids = Vec::new();
        for _ in 0..4 {
            let task = manager
                .submit("true", vec![], None, local_only())
                .await
                .unwrap();
            manager.wait(&task.id, Duration::from_secs(5)).await.unwrap();
            ids.push(task.id);
        }

        assert_eq!(manager.list().await.len(), 2);
        assert!(manager.get(&ids[0]).await.is_none());
        assert!(manager.get(&ids[1]).await.is_none());
        assert!(manager.get(&ids[2]).await.is_some());
        assert!(manager.get(&ids[3]).await.is_some());
    }
}
