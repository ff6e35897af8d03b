use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_core::{
    ExecuteAccepted, ExecuteJobRequest, ExecuteRequest, OutputStream, RemoteJob,
    RemoteJobStatus, TaskListResponse, TaskUpdate, TaskUpdateEvent,
};
use fleet_errors::{FleetError, FleetResult};
use fleet_infrastructure::{run_process, OutputChunk, ProcessOutcome, ProcessSpec, Termination};

use crate::admission::{AdmissionController, SlotGuard};
use crate::job_store::{JobDir, JobStore};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_MAX_FINISHED_JOBS: usize = 1000;

/// Agent 上的作业管理
///
/// 负责准入、启动子进程、收集输出并向流式订阅者广播事件。
pub struct JobManager {
    admission: AdmissionController,
    store: JobStore,
    max_output_bytes: usize,
    max_finished_jobs: usize,
    jobs: RwLock<HashMap<String, RemoteJob>>,
    cancels: Mutex<HashMap<String, oneshot::Sender<()>>>,
    events: broadcast::Sender<TaskUpdate>,
}

struct Launch {
    id: String,
    spec: ProcessSpec,
    guard: SlotGuard,
    job_dir: Option<JobDir>,
}

impl JobManager {
    pub fn new(admission: AdmissionController, store: JobStore, max_output_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            admission,
            store,
            max_output_bytes,
            max_finished_jobs: DEFAULT_MAX_FINISHED_JOBS,
            jobs: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// 内存中最多保留的已结束作业数；更早的记录只能从作业目录读取
    pub fn with_retention(mut self, max_finished_jobs: usize) -> Self {
        self.max_finished_jobs = max_finished_jobs.max(1);
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.events.subscribe()
    }

    fn emit(&self, update: TaskUpdate) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(update);
    }

    /// 登记新作业；优先使用调用方给出的未占用 ID
    async fn register(
        &self,
        requested: Option<&str>,
        make: impl FnOnce(&str) -> RemoteJob,
    ) -> RemoteJob {
        let mut jobs = self.jobs.write().await;
        let id = match requested {
            Some(id) if !id.trim().is_empty() && !jobs.contains_key(id) => id.to_string(),
            Some(id) => {
                debug!(requested = %id, "请求的任务ID不可用，重新分配");
                Uuid::new_v4().to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let job = make(&id);
        jobs.insert(id, job.clone());
        job
    }

    /// 执行一条命令，准入通过后立即返回
    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> FleetResult<ExecuteAccepted> {
        let command = request
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| FleetError::invalid_params("缺少 command"))?;
        let guard = self.admission.admit()?;

        let mut spec = ProcessSpec::new(command.clone(), request.args.clone());
        spec.cwd = request.cwd.map(PathBuf::from);
        spec.env = request.env;
        spec.max_output_bytes = self.max_output_bytes;

        let args = request.args;
        let job = self
            .register(request.task_id.as_deref(), |id| {
                new_job(id, Some(command.clone()), args, None)
            })
            .await;
        let id = job.id;
        info!(job_id = %id, command = %command, "开始执行命令");

        self.launch(Launch {
            id: id.clone(),
            spec,
            guard,
            job_dir: None,
        })
        .await;
        Ok(ExecuteAccepted::started(id))
    }

    /// 执行共享作业目录中的 run.sh
    pub async fn execute_job(
        self: &Arc<Self>,
        request: ExecuteJobRequest,
    ) -> FleetResult<ExecuteAccepted> {
        let job_id = request
            .job_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| FleetError::invalid_params("缺少 jobId"))?;
        let job_dir = self
            .store
            .resolve(&job_id, request.job_path.as_deref())
            .await?;
        let config = job_dir.load_config().await?;
        let guard = self.admission.admit()?;

        let script = job_dir.script().to_string_lossy().into_owned();
        let mut spec = ProcessSpec::new("sh", vec![script.clone()]);
        spec.cwd = Some(job_dir.dir.clone());
        spec.env = config.env;
        spec.max_output_bytes = self.max_output_bytes;

        let job = self
            .register(Some(&job_id), |id| {
                new_job(id, Some("sh".to_string()), vec![script], Some(job_id.clone()))
            })
            .await;
        if let Err(e) = job_dir.write_status(&job).await {
            warn!(job_id = %job_id, "写入作业状态失败: {e}");
        }
        let id = job.id;
        info!(job_id = %job_id, dir = %job_dir.dir.display(), "开始执行作业");

        self.launch(Launch {
            id: id.clone(),
            spec,
            guard,
            job_dir: Some(job_dir),
        })
        .await;
        Ok(ExecuteAccepted::started(id))
    }

    async fn launch(self: &Arc<Self>, launch: Launch) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().await.insert(launch.id.clone(), cancel_tx);
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(launch, cancel_rx).await });
    }

    async fn run(self: Arc<Self>, launch: Launch, cancel: oneshot::Receiver<()>) {
        let Launch {
            id,
            spec,
            guard,
            job_dir,
        } = launch;

        let (tx, rx) = mpsc::unbounded_channel();
        let log = match &job_dir {
            Some(dir) => match dir.open_log().await {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(job_id = %id, "打开输出日志失败: {e}");
                    None
                }
            },
            None => None,
        };
        let forward = tokio::spawn(Arc::clone(&self).forward_output(id.clone(), rx, log));

        let outcome = run_process(spec, Some(tx), cancel).await;
        let _ = forward.await;
        self.cancels.lock().await.remove(&id);

        let job = self.complete(&id, outcome).await;
        // 槽位在终态写入后归还
        drop(guard);
        self.prune_finished().await;

        if let (Some(dir), Some(job)) = (job_dir, job) {
            if let Err(e) = dir.write_status(&job).await {
                warn!(job_id = %id, "写回作业状态失败: {e}");
            }
        }
    }

    async fn forward_output(
        self: Arc<Self>,
        id: String,
        mut rx: mpsc::UnboundedReceiver<OutputChunk>,
        mut log: Option<tokio::fs::File>,
    ) {
        while let Some(chunk) = rx.recv().await {
            if let Some(file) = log.as_mut() {
                if let Err(e) = file.write_all(chunk.data.as_bytes()).await {
                    warn!(job_id = %id, "写入输出日志失败: {e}");
                    log = None;
                }
            }

            if let Some(job) = self.jobs.write().await.get_mut(&id) {
                let buffer = match chunk.stream {
                    OutputStream::Stdout => &mut job.stdout,
                    OutputStream::Stderr => &mut job.stderr,
                };
                if buffer.len() < self.max_output_bytes {
                    buffer.push_str(&chunk.data);
                }
            }

            let event = match chunk.stream {
                OutputStream::Stdout => TaskUpdateEvent::Output,
                OutputStream::Stderr => TaskUpdateEvent::Error,
            };
            self.emit(TaskUpdate::new(&id, event, json!(chunk.data)));
        }
        if let Some(mut file) = log {
            let _ = file.flush().await;
        }
    }

    /// 写入终态并广播，返回最终快照
    async fn complete(&self, id: &str, outcome: FleetResult<ProcessOutcome>) -> Option<RemoteJob> {
        let (status, exit_code, stdout, stderr, error) = match outcome {
            Ok(outcome) => {
                let status = match outcome.termination {
                    Termination::Cancelled => RemoteJobStatus::Cancelled,
                    Termination::TimedOut => RemoteJobStatus::Failed,
                    Termination::Exited => RemoteJobStatus::from_exit_code(outcome.exit_code),
                };
                let error = match status {
                    RemoteJobStatus::Failed => {
                        Some(format!("命令执行失败，退出码: {:?}", outcome.exit_code))
                    }
                    _ => None,
                };
                (status, outcome.exit_code, Some(outcome.stdout), Some(outcome.stderr), error)
            }
            Err(e) => {
                warn!(job_id = %id, "命令启动失败: {e}");
                (
                    RemoteJobStatus::Failed,
                    None,
                    None,
                    Some(e.to_string()),
                    Some(e.to_string()),
                )
            }
        };

        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id)?;
            job.status = status;
            job.exit_code = exit_code;
            job.completed_at = Some(Utc::now());
            if let Some(stdout) = stdout {
                job.stdout = stdout;
            }
            if let Some(stderr) = stderr {
                job.stderr = stderr;
            }
            job.error = error.clone();
            job.clone()
        };

        counter!("fleet_agent_jobs_finished_total", "status" => status_label(status)).increment(1);
        info!(job_id = %id, status = status_label(status), exit_code = ?exit_code, "作业结束");

        let (event, data) = match status {
            RemoteJobStatus::Completed => (TaskUpdateEvent::Completed, json!({ "exitCode": exit_code })),
            RemoteJobStatus::Cancelled => (TaskUpdateEvent::Cancelled, json!({ "exitCode": exit_code })),
            _ => (
                TaskUpdateEvent::Failed,
                json!({ "exitCode": exit_code, "error": error }),
            ),
        };
        self.emit(TaskUpdate::new(id, event, data));
        Some(snapshot)
    }

    /// 超出保留数量时移除最早结束的作业
    async fn prune_finished(&self) {
        let mut jobs = self.jobs.write().await;
        let mut finished: Vec<_> = jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.completed_at.unwrap_or(job.started_at), job.id.clone()))
            .collect();
        if finished.len() <= self.max_finished_jobs {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_finished_jobs;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
        debug!(removed = excess, "清理已结束的作业记录");
    }

    /// 查询作业；内存中没有时回退到作业目录
    pub async fn get(&self, id: &str) -> Option<RemoteJob> {
        if let Some(job) = self.jobs.read().await.get(id) {
            return Some(job.clone());
        }
        self.store.load_snapshot(id).await
    }

    pub async fn list(&self) -> TaskListResponse {
        let mut tasks: Vec<RemoteJob> = self.jobs.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let slots = self.admission.slots();
        TaskListResponse {
            tasks,
            running: slots.running_count() as u32,
            capacity: slots.capacity_count() as u32,
        }
    }

    /// 终止仍在运行的作业
    pub async fn cancel(&self, id: &str) -> FleetResult<()> {
        let status = match self.jobs.read().await.get(id) {
            Some(job) => job.status,
            None => return Err(FleetError::task_not_found(id)),
        };
        if status.is_terminal() {
            return Err(FleetError::NothingToCancel(format!(
                "作业 {id} 已处于 {} 状态",
                status_label(status)
            )));
        }
        let sent = match self.cancels.lock().await.remove(id) {
            Some(signal) => signal.send(()).is_ok(),
            None => false,
        };
        if !sent {
            return Err(FleetError::NothingToCancel(format!("作业 {id} 没有存活的进程")));
        }
        info!(job_id = %id, "已发送终止信号");
        Ok(())
    }
}

fn new_job(id: &str, command: Option<String>, args: Vec<String>, job_id: Option<String>) -> RemoteJob {
    RemoteJob {
        id: id.to_string(),
        command,
        args,
        job_id,
        status: RemoteJobStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        error: None,
    }
}

fn status_label(status: RemoteJobStatus) -> &'static str {
    match status {
        RemoteJobStatus::Running => "running",
        RemoteJobStatus::Completed => "completed",
        RemoteJobStatus::Failed => "failed",
        RemoteJobStatus::Cancelled => "cancelled",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_config::AgentConfig;
    use fleet_core::{NodeCapabilities, NodeStats, StatsProvider};

    use crate::admission::SlotCounter;

    struct IdleStats;

    impl StatsProvider for IdleStats {
        fn hostname(&self) -> String {
            "agent".into()
        }

        fn capabilities(&self) -> NodeCapabilities {
            NodeCapabilities {
                platform: "linux".into(),
                arch: "x86_64".into(),
                cpu_count: 4,
                total_memory_bytes: 1024,
            }
        }

        fn stats(&self) -> NodeStats {
            NodeStats {
                memory_usage_percent: 10.0,
                ..NodeStats::default()
            }
        }
    }

    fn build(capacity: usize, root: &std::path::Path) -> JobManager {
        let admission = AdmissionController::new(
            &AgentConfig::default(),
            Arc::new(SlotCounter::new(capacity)),
            Arc::new(IdleStats),
        );
        JobManager::new(admission, JobStore::new(root), 1024 * 1024)
    }

    fn manager(capacity: usize, root: &std::path::Path) -> Arc<JobManager> {
        Arc::new(build(capacity, root))
    }

    fn request(command: &str, args: &[&str]) -> ExecuteRequest {
        ExecuteRequest {
            command: Some(command.into()),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..ExecuteRequest::default()
        }
    }

    async fn wait_terminal(manager: &JobManager, id: &str) -> RemoteJob {
        for _ in 0..100 {
            if let Some(job) = manager.get(id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_execute_streams_and_completes() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(2, root.path());
        let mut events = manager.subscribe();

        let accepted = manager.execute(request("echo", &["hi"])).await.unwrap();
        assert_eq!(accepted.status, "started");

        let mut saw_output = false;
        loop {
            let update = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(update.task_id, accepted.task_id);
            match update.event {
                TaskUpdateEvent::Output => {
                    saw_output |= update.text().unwrap_or_default().contains("hi")
                }
                TaskUpdateEvent::Completed => {
                    assert_eq!(update.exit_code(), Some(0));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_output);

        let job = wait_terminal(&manager, &accepted.task_id).await;
        assert_eq!(job.status, RemoteJobStatus::Completed);
        assert_eq!(job.stdout.trim(), "hi");
        assert_eq!(manager.admission().slots().running_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot_once() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(1, root.path());
        let accepted = manager
            .execute(request("definitely-not-a-real-binary-xyz", &[]))
            .await
            .unwrap();
        let job = wait_terminal(&manager, &accepted.task_id).await;
        assert_eq!(job.status, RemoteJobStatus::Failed);
        assert!(job.error.is_some());
        assert_eq!(manager.admission().slots().running_count(), 0);

        // 槽位已归还，可以再次接收
        let again = manager.execute(request("true", &[])).await.unwrap();
        wait_terminal(&manager, &again.task_id).await;
        assert_eq!(manager.admission().slots().running_count(), 0);
    }

    #[tokio::test]
    async fn test_requested_id_is_used_once() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(4, root.path());
        let mut first = request("true", &[]);
        first.task_id = Some("hub-task-1".into());
        let accepted = manager.execute(first.clone()).await.unwrap();
        assert_eq!(accepted.task_id, "hub-task-1");

        let second = manager.execute(first).await.unwrap();
        assert_ne!(second.task_id, "hub-task-1");
    }

    #[tokio::test]
    async fn test_missing_command_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(1, root.path());
        let result = manager.execute(ExecuteRequest::default()).await;
        assert!(matches!(result, Err(FleetError::InvalidParams(_))));
        assert_eq!(manager.admission().slots().running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_then_finished() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(1, root.path());
        let accepted = manager.execute(request("sleep", &["10"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.cancel(&accepted.task_id).await.unwrap();
        let job = wait_terminal(&manager, &accepted.task_id).await;
        assert_eq!(job.status, RemoteJobStatus::Cancelled);

        assert!(matches!(
            manager.cancel(&accepted.task_id).await,
            Err(FleetError::NothingToCancel(_))
        ));
        assert!(matches!(
            manager.cancel("unknown").await,
            Err(FleetError::TaskNotFound { .. })
        ));
        assert_eq!(manager.admission().slots().running_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_job_tees_log_and_writes_status() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("job-7");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("run.sh"), "echo \"value=$JOB_VALUE\"\n")
            .await
            .unwrap();
        tokio::fs::write(dir.join("job.json"), r#"{"env":{"JOB_VALUE":"42"}}"#)
            .await
            .unwrap();

        let manager = manager(1, root.path());
        let accepted = manager
            .execute_job(ExecuteJobRequest {
                job_id: Some("job-7".into()),
                job_path: None,
            })
            .await
            .unwrap();
        assert_eq!(accepted.task_id, "job-7");

        let job = wait_terminal(&manager, "job-7").await;
        assert_eq!(job.status, RemoteJobStatus::Completed);
        assert_eq!(job.stdout.trim(), "value=42");

        // 状态写回在终态之后完成
        let mut persisted = None;
        for _ in 0..50 {
            let config = JobDir {
                job_id: "job-7".into(),
                dir: dir.clone(),
            }
            .load_config()
            .await
            .unwrap();
            if config.status == Some(RemoteJobStatus::Completed) {
                persisted = Some(config);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(persisted.unwrap().exit_code, Some(0));
        let log = tokio::fs::read_to_string(dir.join("output.log")).await.unwrap();
        assert_eq!(log.trim(), "value=42");
    }

    #[tokio::test]
    async fn test_get_falls_back_to_job_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("old-job");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("job.json"),
            r#"{"status":"completed","exitCode":0}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("output.log"), "done\n").await.unwrap();

        let manager = manager(1, root.path());
        let job = manager.get("old-job").await.unwrap();
        assert_eq!(job.status, RemoteJobStatus::Completed);
        assert_eq!(job.stdout, "done\n");
        assert!(manager.get("nothing").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_job_script_frees_slot() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("slow-job");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("run.sh"), "sleep 4\necho done\n")
            .await
            .unwrap();

        let manager = manager(1, root.path());
        manager
            .execute_job(ExecuteJobRequest {
                job_id: Some("slow-job".into()),
                job_path: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.cancel("slow-job").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let job = manager.get("slow-job").await.unwrap();
        assert_eq!(job.status, RemoteJobStatus::Cancelled);
        assert!(!job.stdout.contains("done"));
        assert_eq!(manager.admission().slots().running_count(), 0);
        let next = manager.execute(request("true", &[])).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_finished_jobs_are_pruned_beyond_retention() {
        let root = tempfile::tempdir().unwrap();
        let manager = Arc::new(build(4, root.path()).with_retention(2));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let accepted = manager.execute(request("true", &[])).await.unwrap();
            wait_terminal(&manager, &accepted.task_id).await;
            ids.push(accepted.task_id);
        }
        // 最后一个作业结束后清理才会执行
        tokio::time::sleep(Duration::from_millis(50)).await;

        let listed = manager.list().await;
        assert_eq!(listed.tasks.len(), 2);
        assert!(manager.get(&ids[0]).await.is_none());
        assert!(manager.get(&ids[1]).await.is_none());
        assert!(manager.get(&ids[3]).await.is_some());
    }
}
