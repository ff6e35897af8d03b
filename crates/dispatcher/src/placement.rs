use tracing::debug;

use fleet_core::{Node, NodeKey, NodeStats};

/// 无槽位信息时的中性分
const NEUTRAL_SLOT_SCORE: f64 = 50.0;

/// 放置请求
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub require_high_power: bool,
    pub preferred: Option<NodeKey>,
}

/// 节点选择策略
pub trait PlacementStrategy: Send + Sync {
    /// 从节点列表中选出一个节点，没有合格节点时返回 `None`
    fn select_node(&self, nodes: &[Node], request: &PlacementRequest) -> Option<NodeKey>;

    fn name(&self) -> &str;
}

/// 节点得分：CPU、内存、槽位三个子分的平均值，每项都在 [0, 100]
pub fn node_score(stats: &NodeStats) -> f64 {
    let cpu = (100.0 - stats.load_average_1m * 10.0).clamp(0.0, 100.0);
    let memory = (100.0 - stats.memory_usage()).clamp(0.0, 100.0);
    let slots = match (stats.available_slot_count, stats.max_task_count) {
        (Some(available), Some(max)) if max > 0 => {
            (available as f64 / max as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => NEUTRAL_SLOT_SCORE,
    };
    (cpu + memory + slots) / 3.0
}

fn has_free_slot(stats: &NodeStats) -> bool {
    stats.available_slot_count.map(|n| n > 0).unwrap_or(true)
}

/// 按剩余容量打分的策略
///
/// 没有动态信息的节点不参与；同分时保留输入顺序中靠前的节点。
pub struct CapacityScoreStrategy;

impl CapacityScoreStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CapacityScoreStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for CapacityScoreStrategy {
    fn select_node(&self, nodes: &[Node], request: &PlacementRequest) -> Option<NodeKey> {
        let eligible = nodes
            .iter()
            .filter(|node| !request.require_high_power || node.is_high_power())
            .filter_map(|node| node.stats.as_ref().map(|stats| (node, stats)));

        if let Some(preferred) = &request.preferred {
            let hit = nodes
                .iter()
                .filter(|node| !request.require_high_power || node.is_high_power())
                .find(|node| &node.key() == preferred)
                .and_then(|node| node.stats.as_ref().map(|stats| (node, stats)));
            if let Some((node, stats)) = hit {
                if has_free_slot(stats) {
                    debug!("使用指定节点: {}", node.key());
                    return Some(node.key());
                }
            }
            debug!("指定节点 {preferred} 不可用，按得分选择");
        }

        let mut best: Option<(&Node, f64)> = None;
        for (node, stats) in eligible {
            let score = node_score(stats);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((node, score)),
            }
        }

        best.map(|(node, score)| {
            debug!("放置策略选择节点: {} (得分: {:.1})", node.key(), score);
            node.key()
        })
    }

    fn name(&self) -> &str {
        "CapacityScore"
    }
}
