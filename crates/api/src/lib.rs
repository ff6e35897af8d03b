//! # Fleet API
//!
//! 主节点的 REST 接口：提交任务、查询任务、取消任务，以及查看集群节点与队列状态。
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `POST /api/tasks` - 提交任务
//! - `GET /api/tasks` - 任务列表
//! - `GET /api/tasks/{id}` - 任务详情
//! - `POST /api/tasks/{id}/cancel` - 取消任务
//! - `GET /api/nodes` - 已发现的节点及得分
//! - `GET /api/nodes/best` - 当前最优节点
//! - `GET /api/queue/stats` - 队列统计

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{create_routes, AppState};

use axum::Router;
use tower::ServiceBuilder;

use crate::middleware::{cors_layer, request_logging, trace_layer};

/// 创建带中间件的 API 应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
