use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace};

use fleet_core::{
    ClusterAnnounce, DiscoveredVia, DiscoveryMessage, Node, NodeCapabilities, NodeKey, NodeStats,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 节点表变化事件
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Discovered(Node),
    Lost(Node),
}

/// 已发现节点表
///
/// 只有发现服务会修改它，其他组件通过 `nodes()`/`get()` 读取快照。
pub struct NodeTable {
    local_hostname: String,
    nodes: RwLock<HashMap<NodeKey, Node>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl NodeTable {
    pub fn new(local_hostname: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_hostname: local_hostname.into(),
            nodes: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// 按节点标识排序的快照
    pub async fn nodes(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut snapshot: Vec<Node> = nodes.values().cloned().collect();
        snapshot.sort_by(|a, b| a.key().cmp(&b.key()));
        snapshot
    }

    pub async fn get(&self, key: &NodeKey) -> Option<Node> {
        self.nodes.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// 处理一条入站报文，任何解析失败都只记录日志
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let message = match DiscoveryMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                trace!("丢弃来自 {from} 的无效发现报文: {e}");
                counter!("fleet_discovery_malformed_datagrams_total").increment(1);
                return;
            }
        };

        if message.hostname() == self.local_hostname {
            trace!("忽略本机发出的发现报文");
            return;
        }

        match message {
            DiscoveryMessage::ClusterAnnounce(announce) => {
                self.handle_announce(&announce, from.ip()).await;
            }
            DiscoveryMessage::ClusterStats(report) => {
                self.update_stats(&report.hostname, report.port, report.stats)
                    .await;
            }
        }
    }

    pub async fn handle_announce(&self, announce: &ClusterAnnounce, address: IpAddr) -> bool {
        self.upsert(
            &announce.hostname,
            address,
            announce.port,
            announce.capabilities(),
            None,
            DiscoveredVia::Broadcast,
        )
        .await
    }

    /// 新增或刷新节点，返回是否为新节点
    ///
    /// 本机主机名的报文被忽略。
    pub async fn upsert(
        &self,
        hostname: &str,
        address: IpAddr,
        port: u16,
        capabilities: NodeCapabilities,
        stats: Option<NodeStats>,
        via: DiscoveredVia,
    ) -> bool {
        if hostname == self.local_hostname {
            return false;
        }

        let key = NodeKey::new(hostname, port);
        let now = Utc::now();
        let mut nodes = self.nodes.write().await;

        if let Some(node) = nodes.get_mut(&key) {
            node.address = address;
            node.capabilities = capabilities;
            node.last_seen_at = now;
            if stats.is_some() {
                node.stats = stats;
            }
            trace!(node = %key, "刷新节点");
            return false;
        }

        let node = Node {
            hostname: hostname.to_string(),
            address,
            port,
            capabilities,
            stats,
            last_seen_at: now,
            discovered_via: via,
        };
        nodes.insert(key.clone(), node.clone());
        let total = nodes.len();
        drop(nodes);

        info!(node = %key, address = %address, via = ?via, "发现新节点");
        counter!("fleet_discovery_nodes_discovered_total").increment(1);
        gauge!("fleet_discovery_nodes").set(total as f64);
        let _ = self.events.send(DiscoveryEvent::Discovered(node));
        true
    }

    /// 更新已知节点的动态信息，未知节点忽略
    pub async fn update_stats(&self, hostname: &str, port: u16, stats: NodeStats) -> bool {
        if hostname == self.local_hostname {
            return false;
        }
        let key = NodeKey::new(hostname, port);
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&key) {
            Some(node) => {
                node.stats = Some(stats);
                node.last_seen_at = Utc::now();
                true
            }
            None => {
                debug!(node = %key, "忽略未知节点的 stats 报文");
                false
            }
        }
    }

    /// 移除 `last_seen_at` 早于 `now - stale_after` 的节点
    pub async fn expire(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<Node> {
        let mut nodes = self.nodes.write().await;
        let stale: Vec<NodeKey> = nodes
            .iter()
            .filter(|(_, node)| node.is_stale(now, stale_after))
            .map(|(key, _)| key.clone())
            .collect();

        let removed: Vec<Node> = stale.iter().filter_map(|key| nodes.remove(key)).collect();
        let total = nodes.len();
        drop(nodes);

        for node in &removed {
            info!(node = %node.key(), "节点超时，已移除");
            counter!("fleet_discovery_nodes_lost_total").increment(1);
            let _ = self.events.send(DiscoveryEvent::Lost(node.clone()));
        }
        if !removed.is_empty() {
            gauge!("fleet_discovery_nodes").set(total as f64);
        }
        removed
    }

    #[cfg(test)]
    pub(crate) async fn set_last_seen(&self, key: &NodeKey, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.write().await.get_mut(key) {
            node.last_seen_at = at;
        }
    }
}
