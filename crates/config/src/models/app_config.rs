use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    agent::AgentConfig,
    api_observability::{ApiConfig, ObservabilityConfig},
    discovery::DiscoveryConfig,
    task_manager::{QueueConfig, TaskManagerConfig},
};
use crate::validation::ConfigValidator;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoveryConfig,
    pub agent: AgentConfig,
    pub task_manager: TaskManagerConfig,
    pub queue: QueueConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载顺序：内置默认值 -> TOML 文件 -> FLEET_ 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> ConfigResult<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default())?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(ConfigError::File(format!("配置文件不存在: {path}")));
            }
        } else {
            let default_paths = ["config/fleet.toml", "fleet.toml", "/etc/fleet/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.discovery.validate()?;
        if self.agent.enabled {
            self.agent.validate()?;
        }
        self.task_manager.validate()?;
        self.queue.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.stale_after_seconds, 60);
        assert_eq!(config.discovery.scan_concurrency, 10);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [agent]
            enabled = true
            secret = "s3cret"
            max_concurrent_tasks = 2
            "#,
        )
        .unwrap();

        assert!(config.agent.enabled);
        assert_eq!(config.agent.max_concurrent_tasks, 2);
        assert_eq!(config.discovery.port, 41234);
        assert_eq!(config.task_manager.command_timeout_seconds, 300);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [discovery]
            port = 41234
            fallback_port = 41234
            "#,
        );
        assert!(result.is_err());
    }
}
