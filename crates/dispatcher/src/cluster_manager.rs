use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use fleet_core::{
    ExecuteAccepted, ExecuteRequest, Node, NodeKey, RemoteJob, StreamMessage, TaskUpdate,
    CLUSTER_SECRET_HEADER,
};
use fleet_discovery::{DiscoveryEvent, NodeTable};
use fleet_errors::{FleetError, FleetResult};

/// 订阅键：(节点, 任务)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub node: NodeKey,
    pub task_id: String,
}

impl SubscriptionKey {
    pub fn new(node: NodeKey, task_id: impl Into<String>) -> Self {
        Self {
            node,
            task_id: task_id.into(),
        }
    }
}

/// 一个订阅；通过 `receiver` 接收该任务的流式事件
pub struct Subscription {
    pub id: u64,
    pub key: SubscriptionKey,
    pub receiver: mpsc::UnboundedReceiver<TaskUpdate>,
}

type SubscriberMap = HashMap<SubscriptionKey, Vec<(u64, mpsc::UnboundedSender<TaskUpdate>)>>;

struct NodeConnection {
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// hub 与各 Agent 之间的连接管理
///
/// 每个已知节点维护一条 WebSocket 连接，按 (节点, 任务) 分发事件；
/// 命令派发、状态查询与取消走 HTTP。
pub struct ClusterManager {
    table: Arc<NodeTable>,
    http: reqwest::Client,
    secret: String,
    reconnect_backoff: Duration,
    connections: RwLock<HashMap<NodeKey, NodeConnection>>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_subscription_id: AtomicU64,
}

impl ClusterManager {
    pub fn new(table: Arc<NodeTable>, secret: impl Into<String>, reconnect_backoff: Duration) -> Self {
        Self {
            table,
            http: reqwest::Client::new(),
            secret: secret.into(),
            reconnect_backoff,
            connections: RwLock::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }

    /// 跟随节点表事件建立与拆除连接，直到收到关闭信号
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.table.subscribe();
        tokio::spawn(async move {
            for node in manager.table.nodes().await {
                manager.connect(&node).await;
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(DiscoveryEvent::Discovered(node)) => manager.connect(&node).await,
                        Ok(DiscoveryEvent::Lost(node)) => manager.disconnect(&node.key()).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("节点事件积压，跳过 {skipped} 条，重新同步");
                            for node in manager.table.nodes().await {
                                manager.connect(&node).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            manager.disconnect_all().await;
            info!("集群连接管理停止");
        })
    }

    /// 建立到节点的流式连接；已存在时忽略
    pub async fn connect(&self, node: &Node) {
        let key = node.key();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&key) {
            return;
        }

        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(stream_loop(
            key.clone(),
            Arc::clone(&self.table),
            Arc::clone(&self.subscribers),
            Arc::clone(&connected),
            self.reconnect_backoff,
        ));
        connections.insert(key, NodeConnection { connected, task });
    }

    pub async fn disconnect(&self, key: &NodeKey) {
        if let Some(connection) = self.connections.write().await.remove(key) {
            connection.task.abort();
            info!(node = %key, "已断开节点连接");
        }
    }

    async fn disconnect_all(&self) {
        let mut connections = self.connections.write().await;
        for (_, connection) in connections.drain() {
            connection.task.abort();
        }
    }

    pub async fn is_connected(&self, key: &NodeKey) -> bool {
        self.connections
            .read()
            .await
            .get(key)
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn subscribe(&self, node: NodeKey, task_id: impl Into<String>) -> Subscription {
        let key = SubscriptionKey::new(node, task_id);
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push((id, tx));
        Subscription {
            id,
            key,
            receiver: rx,
        }
    }

    /// 移除订阅；某个键的最后一个订阅被移除时键也一并删除
    pub async fn unsubscribe(&self, key: &SubscriptionKey, id: u64) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }

    pub async fn subscription_count(&self, key: &SubscriptionKey) -> usize {
        self.subscribers
            .read()
            .await
            .get(key)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// 把一条入站消息分发给对应订阅者
    pub async fn route(&self, node: &NodeKey, text: &str) {
        route_message(&self.subscribers, node, text).await;
    }

    async fn node(&self, key: &NodeKey) -> FleetResult<Node> {
        self.table
            .get(key)
            .await
            .ok_or_else(|| FleetError::Transport(format!("未知节点: {key}")))
    }

    /// 在节点上执行命令
    pub async fn dispatch(&self, key: &NodeKey, request: &ExecuteRequest) -> FleetResult<ExecuteAccepted> {
        let node = self.node(key).await?;
        let response = self
            .http
            .post(format!("{}/execute", node.base_url()))
            .header(CLUSTER_SECRET_HEADER, &self.secret)
            .json(request)
            .send()
            .await
            .map_err(|e| FleetError::Transport(format!("请求节点 {key} 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(key, status, body));
        }
        let accepted: ExecuteAccepted = response
            .json()
            .await
            .map_err(|e| FleetError::Protocol(format!("节点 {key} 返回无效响应: {e}")))?;
        debug!(node = %key, remote_id = %accepted.task_id, "命令已派发");
        Ok(accepted)
    }

    /// 查询节点上的任务快照，不存在时返回 `None`
    pub async fn fetch_job(&self, key: &NodeKey, job_id: &str) -> FleetResult<Option<RemoteJob>> {
        let node = self.node(key).await?;
        let response = self
            .http
            .get(format!("{}/task/{job_id}", node.base_url()))
            .header(CLUSTER_SECRET_HEADER, &self.secret)
            .send()
            .await
            .map_err(|e| FleetError::Transport(format!("请求节点 {key} 失败: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(key, status, body));
        }
        let job = response
            .json()
            .await
            .map_err(|e| FleetError::Protocol(format!("节点 {key} 返回无效响应: {e}")))?;
        Ok(Some(job))
    }

    /// 请求节点终止任务
    pub async fn cancel_job(&self, key: &NodeKey, job_id: &str) -> FleetResult<()> {
        let node = self.node(key).await?;
        let response = self
            .http
            .post(format!("{}/task/{job_id}/cancel", node.base_url()))
            .header(CLUSTER_SECRET_HEADER, &self.secret)
            .send()
            .await
            .map_err(|e| FleetError::Transport(format!("请求节点 {key} 失败: {e}")))?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(FleetError::NothingToCancel(job_id.to_string()))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(map_status(key, s, body))
            }
        }
    }
}

fn map_status(key: &NodeKey, status: StatusCode, body: String) -> FleetError {
    match status {
        StatusCode::FORBIDDEN => FleetError::Authorization(format!("节点 {key} 拒绝了集群密钥")),
        StatusCode::SERVICE_UNAVAILABLE => {
            FleetError::Admission(format!("节点 {key} 容量不足: {body}"))
        }
        s => FleetError::Transport(format!("节点 {key} 返回 {s}: {body}")),
    }
}

async fn route_message(subscribers: &RwLock<SubscriberMap>, node: &NodeKey, text: &str) {
    let update = match StreamMessage::parse(text) {
        Some(StreamMessage::TaskUpdate(update)) => update,
        None => {
            debug!(node = %node, "忽略无法识别的流消息");
            return;
        }
    };

    let key = SubscriptionKey::new(node.clone(), update.task_id.clone());
    let subscribers = subscribers.read().await;
    if let Some(list) = subscribers.get(&key) {
        for (_, tx) in list {
            let _ = tx.send(update.clone());
        }
    }
}

async fn stream_loop(
    key: NodeKey,
    table: Arc<NodeTable>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    connected: Arc<AtomicBool>,
    backoff: Duration,
) {
    loop {
        let Some(node) = table.get(&key).await else {
            debug!(node = %key, "节点已不在节点表中，停止重连");
            break;
        };

        match connect_async(node.stream_url()).await {
            Ok((mut stream, _)) => {
                connected.store(true, Ordering::SeqCst);
                info!(node = %key, "流式连接已建立");
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            route_message(&subscribers, &key, text.as_str()).await;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(node = %key, "流式连接出错: {e}");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                warn!(node = %key, "流式连接断开，{}秒后重连", backoff.as_secs());
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                debug!(node = %key, "连接节点失败，{}秒后重试: {e}", backoff.as_secs());
            }
        }
        tokio::time::sleep(backoff).await;
    }
    connected.store(false, Ordering::SeqCst);
}
