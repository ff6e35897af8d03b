use crate::models::{NodeCapabilities, NodeStats};

/// 节点资源信息来源
///
/// hub 与 Agent 都通过它生成发现协议的广播内容；
/// Agent 的实现会附带运行中任务数与槽位信息。
pub trait StatsProvider: Send + Sync {
    fn hostname(&self) -> String;

    fn capabilities(&self) -> NodeCapabilities;

    fn stats(&self) -> NodeStats;
}
