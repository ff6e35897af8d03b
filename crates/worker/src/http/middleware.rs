use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::warn;

use fleet_core::CLUSTER_SECRET_HEADER;

use super::error::AgentError;
use super::routes::AgentState;

/// 校验 X-Cluster-Secret 请求头
pub async fn require_secret(
    State(state): State<AgentState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(CLUSTER_SECRET_HEADER)
        .map(|v| secret_matches(v.as_bytes(), state.secret.as_bytes()))
        .unwrap_or(false);
    if !authorized {
        warn!(path = %request.uri().path(), "集群密钥校验失败");
        return AgentError::Forbidden.into_response();
    }
    next.run(request).await
}

/// 常量时间比较密钥
fn secret_matches(provided: &[u8], expected: &[u8]) -> bool {
    bool::from(provided.ct_eq(expected))
}
