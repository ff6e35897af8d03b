use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("网络传输错误: {0}")]
    Transport(String),
    #[error("准入拒绝: {0}")]
    Admission(String),
    #[error("任务执行错误: {0}")]
    Execution(String),
    #[error("协议错误: {0}")]
    Protocol(String),
    #[error("鉴权失败: {0}")]
    Authorization(String),
    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("没有可取消的任务: {0}")]
    NothingToCancel(String),
    #[error("集群容量不足: {0}")]
    CapacityExceeded(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("队列错误: {0}")]
    Queue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("无效的请求参数: {0}")]
    InvalidParams(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        Self::NodeNotFound { id: id.into() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::Internal(_) | FleetError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Transport(_) | FleetError::Queue(_) | FleetError::Timeout(_)
        )
    }
    /// 面向调用方的简短描述，不包含内部细节
    pub fn user_message(&self) -> &str {
        match self {
            FleetError::TaskNotFound { .. } => "请求的任务不存在",
            FleetError::NodeNotFound { .. } => "请求的集群节点不存在",
            FleetError::Admission(_) => "节点繁忙，请稍后重试",
            FleetError::CapacityExceeded(_) => "没有可用的执行容量",
            FleetError::Authorization(_) => "集群密钥校验失败",
            FleetError::NothingToCancel(_) => "任务已结束，无需取消",
            FleetError::InvalidParams(_) => "请求参数有误",
            FleetError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
