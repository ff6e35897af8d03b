use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fleet_config::QueueConfig;
use fleet_core::{JobProcessor, QueueStats, QueuedJob, WorkQueue};
use fleet_errors::{FleetError, FleetResult};

const DATA_FIELD: &str = "data";
const READ_BATCH: usize = 16;

fn queue_error(context: &str, err: RedisError) -> FleetError {
    FleetError::Queue(format!("{context}: {err}"))
}

/// 基于 Redis Stream 的持久化工作队列
///
/// # 行为
///
/// - 作业以 `data` 字段写入 Stream，由消费者组 `consumer_group` 读取
/// - 启动时先以 id `0` 重新读取本消费者未确认的作业，再读取新作业
/// - 可重试的失败按 `backoff_ms * 2^attempt` 退避重试，最多 `max_attempts` 次；
///   重试期间条目保持未确认状态，进程崩溃后可以恢复
/// - 完成与失败计数保存在 `<stream_key>:stats` 哈希中
pub struct RedisWorkQueue {
    client: Client,
    conn: ConnectionManager,
    config: QueueConfig,
    consumer_name: String,
}

impl RedisWorkQueue {
    /// 连接 Redis 并确保消费者组存在
    pub async fn connect(config: QueueConfig, consumer_name: impl Into<String>) -> FleetResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| queue_error("创建Redis客户端失败", e))?;

        let connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
        let mut conn = tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                FleetError::Queue(format!(
                    "连接Redis超时（{}秒）",
                    config.connect_timeout_seconds
                ))
            })?
            .map_err(|e| queue_error("连接Redis失败", e))?;

        let pong: String = tokio::time::timeout(
            connect_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| FleetError::Queue("Redis PING 超时".to_string()))?
        .map_err(|e| queue_error("Redis PING 失败", e))?;
        debug!("Redis PING 响应: {pong}");

        let queue = Self {
            client,
            conn,
            config,
            consumer_name: consumer_name.into(),
        };
        queue.ensure_consumer_group().await?;

        info!(
            "Redis 工作队列已连接: stream={}, group={}, consumer={}",
            queue.config.stream_key, queue.config.consumer_group, queue.consumer_name
        );
        Ok(queue)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.config.stream_key)
    }

    async fn ensure_consumer_group(&self) -> FleetResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.consumer_group, "0")
            .await;

        match result {
            Ok(()) => {
                info!(
                    "创建消费者组 {} (stream: {})",
                    self.config.consumer_group, self.config.stream_key
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("消费者组 {} 已存在", self.config.consumer_group);
                Ok(())
            }
            Err(e) => Err(queue_error("创建消费者组失败", e)),
        }
    }

    /// 读取一批条目；`start_id` 为 `0` 时读取本消费者未确认的条目
    async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        start_id: &str,
        block: bool,
    ) -> FleetResult<Vec<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.consumer_name)
            .count(READ_BATCH);
        if block {
            options = options.block(self.config.block_ms as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream_key], &[start_id], &options)
            .await
            .map_err(|e| queue_error("读取Redis Stream失败", e))?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    fn spawn_entry(&self, entry: StreamId, processor: Arc<dyn JobProcessor>) {
        let worker = EntryWorker {
            conn: self.conn.clone(),
            stream_key: self.config.stream_key.clone(),
            group: self.config.consumer_group.clone(),
            stats_key: self.stats_key(),
            max_attempts: self.config.max_attempts.max(1),
            backoff_ms: self.config.backoff_ms,
        };
        tokio::spawn(async move { worker.run(entry, processor).await });
    }
}

/// 单个 Stream 条目的处理上下文
struct EntryWorker {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    stats_key: String,
    max_attempts: u32,
    backoff_ms: u64,
}

impl EntryWorker {
    async fn run(mut self, entry: StreamId, processor: Arc<dyn JobProcessor>) {
        let payload: Option<String> = entry.get(DATA_FIELD);
        let job = match payload.as_deref().map(serde_json::from_str::<QueuedJob>) {
            Some(Ok(job)) => job,
            Some(Err(e)) => {
                warn!("无法解析队列条目 {}: {e}", entry.id);
                self.finish(&entry.id, None).await;
                return;
            }
            None => {
                warn!("队列条目 {} 缺少 data 字段", entry.id);
                self.finish(&entry.id, None).await;
                return;
            }
        };

        let outcome =
            process_with_retry(processor.as_ref(), job, self.max_attempts, self.backoff_ms).await;
        self.finish(&entry.id, Some(outcome.as_str())).await;
    }

    async fn finish(&mut self, entry_id: &str, outcome: Option<&str>) {
        let acked: Result<i64, RedisError> =
            self.conn.xack(&self.stream_key, &self.group, &[entry_id]).await;
        if let Err(e) = acked {
            error!("确认队列条目 {entry_id} 失败: {e}");
            return;
        }
        let deleted: Result<i64, RedisError> = self.conn.xdel(&self.stream_key, &[entry_id]).await;
        if let Err(e) = deleted {
            warn!("删除队列条目 {entry_id} 失败: {e}");
        }
        if let Some(outcome) = outcome {
            let counted: Result<i64, RedisError> =
                self.conn.hincr(&self.stats_key, outcome, 1).await;
            if let Err(e) = counted {
                warn!("更新队列统计失败: {e}");
            }
            counter!("fleet_queue_jobs_processed_total", "outcome" => outcome.to_string())
                .increment(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Completed,
    Failed,
}

impl EntryOutcome {
    fn as_str(self) -> &'static str {
        match self {
            EntryOutcome::Completed => "completed",
            EntryOutcome::Failed => "failed",
        }
    }
}

/// 处理一个作业，可重试的错误按 `backoff_ms * 2^attempt` 退避重试
///
/// 不可重试的错误（例如节点准入拒绝、密钥错误）立即交给 `on_exhausted`，
/// 不会在队列中静默等待。
async fn process_with_retry(
    processor: &dyn JobProcessor,
    mut job: QueuedJob,
    max_attempts: u32,
    backoff_ms: u64,
) -> EntryOutcome {
    loop {
        match processor.process(&job).await {
            Ok(()) => return EntryOutcome::Completed,
            Err(e) if e.is_retryable() && job.attempt + 1 < max_attempts => {
                let delay = backoff_ms.saturating_mul(1u64 << job.attempt.min(16));
                warn!(
                    task_id = %job.task_id,
                    attempt = job.attempt + 1,
                    "作业处理失败，{delay}ms 后重试: {e}"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                job.attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(task_id = %job.task_id, attempts = job.attempt + 1, "作业重试次数用尽: {e}");
                } else {
                    warn!(task_id = %job.task_id, "作业处理失败且不可重试: {e}");
                }
                processor.on_exhausted(&job, e).await;
                return EntryOutcome::Failed;
            }
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn start(
        &self,
        processor: Arc<dyn JobProcessor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        // 阻塞读取使用独立连接，避免阻塞其他命令
        let mut read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| queue_error("创建消费连接失败", e))?;

        let pending = self.read_batch(&mut read_conn, "0", false).await?;
        if !pending.is_empty() {
            info!("恢复 {} 个未确认的作业", pending.len());
        }
        for entry in pending {
            self.spawn_entry(entry, Arc::clone(&processor));
        }

        loop {
            tokio::select! {
                batch = self.read_batch(&mut read_conn, ">", true) => {
                    match batch {
                        Ok(entries) => {
                            for entry in entries {
                                self.spawn_entry(entry, Arc::clone(&processor));
                            }
                        }
                        Err(e) => {
                            error!("消费作业失败: {e}");
                            tokio::time::sleep(Duration::from_millis(self.config.backoff_ms)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Redis 工作队列消费者停止");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn enqueue(&self, job: QueuedJob) -> FleetResult<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.config.stream_key, "*", &[(DATA_FIELD, payload)])
            .await
            .map_err(|e| queue_error("写入Redis Stream失败", e))?;
        debug!(task_id = %job.task_id, "作业已入队: {entry_id}");
        Ok(())
    }

    async fn stats(&self) -> FleetResult<QueueStats> {
        let mut conn = self.conn.clone();
        let length: u64 = conn
            .xlen(&self.config.stream_key)
            .await
            .map_err(|e| queue_error("读取队列长度失败", e))?;
        let pending: StreamPendingReply = conn
            .xpending(&self.config.stream_key, &self.config.consumer_group)
            .await
            .map_err(|e| queue_error("读取未确认作业失败", e))?;
        let completed: Option<u64> = conn
            .hget(self.stats_key(), "completed")
            .await
            .map_err(|e| queue_error("读取队列统计失败", e))?;
        let failed: Option<u64> = conn
            .hget(self.stats_key(), "failed")
            .await
            .map_err(|e| queue_error("读取队列统计失败", e))?;

        let active = pending.count() as u64;
        Ok(QueueStats {
            waiting: length.saturating_sub(active),
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NodeKey;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// 按顺序返回预设结果的处理器
    struct Scripted {
        errors: Mutex<Vec<FleetError>>,
        attempts: AtomicU32,
        exhausted: Mutex<Vec<(u32, String)>>,
    }

    impl Scripted {
        fn new(errors: Vec<FleetError>) -> Self {
            Self {
                errors: Mutex::new(errors),
                attempts: AtomicU32::new(0),
                exhausted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobProcessor for Scripted {
        async fn process(&self, _job: &QueuedJob) -> FleetResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut errors = self.errors.lock().unwrap();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors.remove(0))
            }
        }

        async fn on_exhausted(&self, job: &QueuedJob, error: FleetError) {
            self.exhausted
                .lock()
                .unwrap()
                .push((job.attempt, error.to_string()));
        }
    }

    fn job() -> QueuedJob {
        QueuedJob::new("t1", NodeKey::new("n1", 3100))
    }

    #[tokio::test]
    async fn test_admission_rejection_is_not_retried() {
        let processor = Scripted::new(vec![FleetError::Admission("节点繁忙".into())]);
        let outcome = process_with_retry(&processor, job(), 3, 1).await;
        assert_eq!(outcome, EntryOutcome::Failed);
        assert_eq!(processor.attempts.load(Ordering::SeqCst), 1);
        let exhausted = processor.exhausted.lock().unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].0, 0);
        assert!(exhausted[0].1.contains("节点繁忙"));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_then_succeed() {
        let processor = Scripted::new(vec![
            FleetError::Transport("连接被拒绝".into()),
            FleetError::Transport("连接被拒绝".into()),
        ]);
        let outcome = process_with_retry(&processor, job(), 3, 1).await;
        assert_eq!(outcome, EntryOutcome::Completed);
        assert_eq!(processor.attempts.load(Ordering::SeqCst), 3);
        assert!(processor.exhausted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let processor = Scripted::new(vec![
            FleetError::Transport("a".into()),
            FleetError::Transport("b".into()),
            FleetError::Transport("c".into()),
        ]);
        let outcome = process_with_retry(&processor, job(), 2, 1).await;
        assert_eq!(outcome, EntryOutcome::Failed);
        assert_eq!(processor.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(processor.exhausted.lock().unwrap()[0].0, 1);
    }
}
