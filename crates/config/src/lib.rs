pub mod models;
pub mod validation;

#[cfg(test)]
mod tests;

pub use models::{
    AgentConfig, ApiConfig, AppConfig, DiscoveryConfig, LogFormat, ObservabilityConfig,
    QueueConfig, TaskManagerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Configuration(String),

    #[error("配置校验失败: {0}")]
    Validation(String),

    #[error("配置文件错误: {0}")]
    File(String),

    #[error("配置解析失败: {0}")]
    Parse(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
