use chrono::Utc;
use serde::{Deserialize, Serialize};

use fleet_errors::{FleetError, FleetResult};

use super::node::{NodeCapabilities, NodeStats};

/// 存在性广播：`cluster_announce`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAnnounce {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub cpus: u32,
    pub total_memory: u64,
    pub port: u16,
    pub timestamp: i64,
}

impl ClusterAnnounce {
    pub fn new(hostname: impl Into<String>, port: u16, capabilities: &NodeCapabilities) -> Self {
        Self {
            hostname: hostname.into(),
            platform: capabilities.platform.clone(),
            arch: capabilities.arch.clone(),
            cpus: capabilities.cpu_count,
            total_memory: capabilities.total_memory_bytes,
            port,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            platform: self.platform.clone(),
            arch: self.arch.clone(),
            cpu_count: self.cpus,
            total_memory_bytes: self.total_memory,
        }
    }
}

/// 资源广播：`cluster_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub hostname: String,
    pub port: u16,
    pub stats: NodeStats,
    pub timestamp: i64,
}

/// 发现协议的 UDP 报文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    ClusterAnnounce(ClusterAnnounce),
    ClusterStats(ClusterStats),
}

impl DiscoveryMessage {
    pub fn stats(hostname: impl Into<String>, port: u16, stats: NodeStats) -> Self {
        DiscoveryMessage::ClusterStats(ClusterStats {
            hostname: hostname.into(),
            port,
            stats,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn hostname(&self) -> &str {
        match self {
            DiscoveryMessage::ClusterAnnounce(m) => &m.hostname,
            DiscoveryMessage::ClusterStats(m) => &m.hostname,
        }
    }

    pub fn encode(&self) -> FleetResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解析报文，任何格式问题都归为协议错误
    pub fn decode(bytes: &[u8]) -> FleetResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FleetError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskUpdateEvent {
    Output,
    Error,
    Completed,
    Failed,
    Cancelled,
}

impl TaskUpdateEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskUpdateEvent::Completed | TaskUpdateEvent::Failed | TaskUpdateEvent::Cancelled
        )
    }
}

/// Agent 流式通道上的 `task_update` 事件
///
/// 输出事件的 `data` 为文本块，终态事件的 `data` 携带 `exitCode` 等结果字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: String,
    pub event: TaskUpdateEvent,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl TaskUpdate {
    pub fn new(task_id: impl Into<String>, event: TaskUpdateEvent, data: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            event,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.data.as_str()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.data
            .get("exitCode")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    TaskUpdate(TaskUpdate),
}

impl StreamMessage {
    pub fn to_json(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 未知类型与损坏消息返回 `None`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
