use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error};

use fleet_core::{JobProcessor, QueueStats, QueuedJob, WorkQueue};
use fleet_errors::{FleetError, FleetResult};

/// 直接执行队列
///
/// 没有持久化后端时使用：入队即在后台任务中处理，失败只记录日志，
/// 不提供重试。统计信息恒为 0。
#[derive(Default)]
pub struct DirectWorkQueue {
    processor: RwLock<Option<Arc<dyn JobProcessor>>>,
}

impl DirectWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for DirectWorkQueue {
    async fn start(
        &self,
        processor: Arc<dyn JobProcessor>,
        _shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        *self.processor.write().await = Some(processor);
        debug!("直接执行队列已就绪");
        Ok(())
    }

    async fn enqueue(&self, job: QueuedJob) -> FleetResult<()> {
        let processor = self
            .processor
            .read()
            .await
            .clone()
            .ok_or_else(|| FleetError::Queue("直接执行队列尚未启动".to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = processor.process(&job).await {
                error!(task_id = %job.task_id, node = %job.node_id, "作业处理失败: {e}");
                processor.on_exhausted(&job, e).await;
            }
        });
        Ok(())
    }

    async fn stats(&self) -> FleetResult<QueueStats> {
        Ok(QueueStats::default())
    }

    fn backend_name(&self) -> &'static str {
        "direct"
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NodeKey;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: &QueuedJob) -> FleetResult<()> {
            let _ = self.0.send(job.task_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let queue = DirectWorkQueue::new();
        let result = queue
            .enqueue(QueuedJob::new("t1", NodeKey::new("n1", 3100)))
            .await;
        assert!(matches!(result, Err(FleetError::Queue(_))));
    }

    #[tokio::test]
    async fn test_enqueue_processes_immediately() {
        let queue = DirectWorkQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        queue.start(Arc::new(Recorder(tx)), shutdown_rx).await.unwrap();

        queue
            .enqueue(QueuedJob::new("t1", NodeKey::new("n1", 3100)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("t1"));
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        assert!(!queue.is_durable());
    }
}
