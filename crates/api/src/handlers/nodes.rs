use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use fleet_core::Node;
use fleet_dispatcher::{node_score, PlacementRequest};

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    #[serde(flatten)]
    pub node: Node,
    pub high_power: bool,
    pub score: Option<f64>,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.key().to_string(),
            high_power: node.is_high_power(),
            score: node.stats.as_ref().map(node_score),
            node,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BestNodeQuery {
    #[serde(default)]
    pub high_power: bool,
}

pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes: Vec<NodeView> = state
        .table
        .nodes()
        .await
        .into_iter()
        .map(NodeView::from)
        .collect();
    success(nodes)
}

pub async fn best_node(
    State(state): State<AppState>,
    Query(query): Query<BestNodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let nodes = state.table.nodes().await;
    let request = PlacementRequest {
        require_high_power: query.high_power,
        preferred: None,
    };
    let key = state
        .placement
        .select_node(&nodes, &request)
        .ok_or_else(|| ApiError::NotFound("没有可用节点".to_string()))?;
    let node = nodes
        .into_iter()
        .find(|node| node.key() == key)
        .ok_or_else(|| ApiError::NotFound(format!("节点 {key}")))?;
    Ok(success(NodeView::from(node)))
}
