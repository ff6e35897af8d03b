use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use fleet_errors::FleetError;

/// Agent HTTP 接口的错误响应
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("集群密钥不匹配")]
    Forbidden,

    #[error("未找到资源: {0}")]
    NotFound(String),
}

impl AgentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::Forbidden => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Fleet(err) => match err {
                FleetError::Authorization(_) => StatusCode::FORBIDDEN,
                FleetError::Admission(_) | FleetError::CapacityExceeded(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FleetError::InvalidParams(_) | FleetError::NothingToCancel(_) => {
                    StatusCode::BAD_REQUEST
                }
                FleetError::TaskNotFound { .. } | FleetError::NodeNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
