use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// hub API 的统一响应信封
///
/// 成功时 `data` 携带结果，失败时由 [`crate::ApiError`] 生成 `error` 字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        self.with_status(StatusCode::OK)
    }
}

/// 200 + 数据
pub fn success<T: Serialize>(data: T) -> Response {
    ApiResponse::ok(data).with_status(StatusCode::OK)
}

/// 202：任务已接受，执行结果需要之后查询
pub fn accepted<T: Serialize>(data: T) -> Response {
    ApiResponse::ok(data)
        .with_message("任务已接受")
        .with_status(StatusCode::ACCEPTED)
}
