use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use fleet_errors::FleetError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Fleet(#[from] FleetError),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Fleet(err) => match err {
                FleetError::Authorization(_) => (StatusCode::FORBIDDEN, "AUTHORIZATION_ERROR"),
                FleetError::Admission(_) => (StatusCode::SERVICE_UNAVAILABLE, "ADMISSION_REJECTED"),
                FleetError::CapacityExceeded(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED")
                }
                FleetError::InvalidParams(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAMS"),
                FleetError::NothingToCancel(_) => (StatusCode::BAD_REQUEST, "NOTHING_TO_CANCEL"),
                FleetError::TaskNotFound { .. } => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
                FleetError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
                FleetError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.parts();
        let message = match &self {
            ApiError::Fleet(err) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("请求处理失败: {err}");
                err.user_message().to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
