use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

/// Hub 侧任务管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// 本地执行的墙钟超时
    pub command_timeout_seconds: u64,
    /// 等待远程任务结束的超时
    pub job_wait_timeout_seconds: u64,
    pub remote_poll_interval_ms: u64,
    pub reconnect_backoff_seconds: u64,
    /// 无法调度到集群时是否允许在本机执行
    pub allow_local: bool,
    /// 调用 Agent 时携带的共享密钥
    pub cluster_secret: String,
    /// 内存中保留的已结束任务数量
    pub max_finished_tasks: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 300,
            job_wait_timeout_seconds: 300,
            remote_poll_interval_ms: 2000,
            reconnect_backoff_seconds: 5,
            allow_local: true,
            cluster_secret: crate::models::agent::DEFAULT_CLUSTER_SECRET.to_string(),
            max_finished_tasks: 1000,
        }
    }
}

impl TaskManagerConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.cluster_secret == crate::models::agent::DEFAULT_CLUSTER_SECRET
    }
}

impl ConfigValidator for TaskManagerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.command_timeout_seconds,
            "task_manager.command_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.job_wait_timeout_seconds,
            "task_manager.job_wait_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.reconnect_backoff_seconds,
            "task_manager.reconnect_backoff_seconds",
        )?;
        if self.remote_poll_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "task_manager.remote_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        ValidationUtils::validate_not_empty(&self.cluster_secret, "task_manager.cluster_secret")?;
        ValidationUtils::validate_count(
            self.max_finished_tasks,
            "task_manager.max_finished_tasks",
            1_000_000,
        )?;
        Ok(())
    }
}

/// 可选的持久化队列（Redis Streams）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub connect_timeout_seconds: u64,
    pub block_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_key: "fleet:jobs".to_string(),
            consumer_group: "fleet-hub".to_string(),
            max_attempts: 3,
            backoff_ms: 1000,
            connect_timeout_seconds: 2,
            block_ms: 1000,
        }
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_url(&self.redis_url, "queue.redis_url")?;
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(crate::ConfigError::Validation(
                "queue.redis_url must start with redis:// or rediss://".to_string(),
            ));
        }
        ValidationUtils::validate_not_empty(&self.stream_key, "queue.stream_key")?;
        ValidationUtils::validate_not_empty(&self.consumer_group, "queue.consumer_group")?;
        ValidationUtils::validate_count(self.max_attempts as usize, "queue.max_attempts", 100)?;
        ValidationUtils::validate_timeout_seconds(
            self.connect_timeout_seconds,
            "queue.connect_timeout_seconds",
        )?;
        Ok(())
    }
}
