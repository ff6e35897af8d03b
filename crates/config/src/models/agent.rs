use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

pub const DEFAULT_CLUSTER_SECRET: &str = "fleet-cluster-secret";

/// 节点 Agent 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// 与 hub 共享的密钥，通过 X-Cluster-Secret 头校验
    pub secret: String,
    pub max_concurrent_tasks: usize,
    pub max_memory_percent: f64,
    pub max_cpu_percent: f64,
    pub jobs_dir: String,
    /// 内存中为每个输出流保留的最大字节数
    pub max_output_bytes: usize,
    /// 内存中保留的已结束作业数量
    pub max_finished_jobs: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:3100".to_string(),
            secret: DEFAULT_CLUSTER_SECRET.to_string(),
            max_concurrent_tasks: 4,
            max_memory_percent: 90.0,
            max_cpu_percent: 90.0,
            jobs_dir: "./jobs".to_string(),
            max_output_bytes: 1024 * 1024,
            max_finished_jobs: 1000,
        }
    }
}

impl AgentConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_CLUSTER_SECRET
    }
}

impl ConfigValidator for AgentConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_socket_addr(&self.bind_address, "agent.bind_address")?;
        ValidationUtils::validate_not_empty(&self.secret, "agent.secret")?;
        ValidationUtils::validate_count(self.max_concurrent_tasks, "agent.max_concurrent_tasks", 1000)?;
        ValidationUtils::validate_percent(self.max_memory_percent, "agent.max_memory_percent")?;
        ValidationUtils::validate_percent(self.max_cpu_percent, "agent.max_cpu_percent")?;
        ValidationUtils::validate_not_empty(&self.jobs_dir, "agent.jobs_dir")?;
        ValidationUtils::validate_count(self.max_finished_jobs, "agent.max_finished_jobs", 1_000_000)?;
        if self.max_output_bytes == 0 {
            return Err(crate::ConfigError::Validation(
                "agent.max_output_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
