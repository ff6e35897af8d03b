use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use testcontainers::runners::AsyncRunner;
use testcontainers::ImageExt;
use testcontainers_modules::redis::Redis;
use tokio::sync::{broadcast, mpsc};

use fleet_config::QueueConfig;
use fleet_core::{JobProcessor, NodeKey, QueuedJob, WorkQueue};
use fleet_errors::{FleetError, FleetResult};
use fleet_infrastructure::RedisWorkQueue;

/// 第一次处理失败、第二次成功的处理器
struct FlakyProcessor {
    seen: mpsc::UnboundedSender<(String, u32)>,
}

#[async_trait]
impl JobProcessor for FlakyProcessor {
    async fn process(&self, job: &QueuedJob) -> FleetResult<()> {
        let _ = self.seen.send((job.task_id.clone(), job.attempt));
        if job.attempt == 0 {
            return Err(FleetError::Transport("节点暂时不可达".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
#[ignore] // 需要 Docker
async fn test_redis_queue_retries_and_counts() -> Result<()> {
    let container = Redis::default().with_tag("7-alpine").start().await?;
    let port = container.get_host_port_ipv4(6379).await?;

    let config = QueueConfig {
        enabled: true,
        redis_url: format!("redis://127.0.0.1:{port}"),
        backoff_ms: 50,
        block_ms: 100,
        ..QueueConfig::default()
    };
    let queue = Arc::new(RedisWorkQueue::connect(config, "fleet-hub-test").await?);
    assert!(queue.is_durable());

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .start(Arc::new(FlakyProcessor { seen: seen_tx }), shutdown_rx)
                .await
        })
    };

    queue
        .enqueue(QueuedJob::new("task-1", NodeKey::new("node-a", 3100)))
        .await?;

    let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await?;
    assert_eq!(first, Some(("task-1".to_string(), 0)));
    let second = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await?;
    assert_eq!(second, Some(("task-1".to_string(), 1)));

    let mut completed = 0;
    for _ in 0..50 {
        let stats = queue.stats().await?;
        completed = stats.completed;
        if completed == 1 {
            assert_eq!(stats.active, 0);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(completed, 1);

    let _ = shutdown_tx.send(());
    consumer.await??;
    Ok(())
}
