use std::sync::Arc;

use tracing::{info, warn};

use fleet_config::QueueConfig;
use fleet_core::WorkQueue;

use crate::{DirectWorkQueue, RedisWorkQueue};

pub struct WorkQueueFactory;

impl WorkQueueFactory {
    /// 按配置创建工作队列
    ///
    /// 持久化队列未启用或 Redis 不可达时退化为直接执行队列，启动不会因此失败。
    pub async fn create(config: &QueueConfig, consumer_name: &str) -> Arc<dyn WorkQueue> {
        if !config.enabled {
            info!("持久化队列未启用，使用直接执行模式");
            return Arc::new(DirectWorkQueue::new());
        }

        match RedisWorkQueue::connect(config.clone(), consumer_name).await {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                warn!(
                    "Redis 队列不可用（{}），退化为直接执行模式: {e}",
                    config.redis_url
                );
                Arc::new(DirectWorkQueue::new())
            }
        }
    }

    /// 消费者名称需要跨重启保持稳定，才能恢复未确认的作业
    pub fn consumer_name(hostname: &str) -> String {
        format!("fleet-hub-{hostname}")
    }
}
