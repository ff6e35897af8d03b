use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use fleet_errors::FleetError;

/// 内存达到该值的节点视为高性能节点
pub const HIGH_POWER_MEMORY_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// 节点标识：`hostname:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub hostname: String,
    pub port: u16,
}

impl NodeKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for NodeKey {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hostname, port) = s
            .rsplit_once(':')
            .ok_or_else(|| FleetError::invalid_params(format!("无效的节点标识: {s}")))?;
        if hostname.is_empty() {
            return Err(FleetError::invalid_params(format!("无效的节点标识: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| FleetError::invalid_params(format!("无效的节点端口 {s}: {e}")))?;
        Ok(Self::new(hostname, port))
    }
}

impl Serialize for NodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveredVia {
    Broadcast,
    ActiveScan,
}

/// 节点的静态能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    pub platform: String,
    pub arch: String,
    pub cpu_count: u32,
    pub total_memory_bytes: u64,
}

/// 节点的动态资源状况，随 stats 消息刷新
///
/// 字段名与发现协议、Agent `/stats` 接口的 JSON 保持一致。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// 1 分钟平均负载
    #[serde(rename = "cpu")]
    pub load_average_1m: f64,
    #[serde(rename = "memoryUsed")]
    pub memory_used_bytes: u64,
    #[serde(rename = "memoryFree")]
    pub memory_free_bytes: u64,
    #[serde(rename = "memoryTotal")]
    pub memory_total_bytes: u64,
    #[serde(rename = "memoryUsagePercent", default)]
    pub memory_usage_percent: f64,
    #[serde(rename = "uptime", default)]
    pub uptime_seconds: u64,
    #[serde(rename = "runningTasks", default, skip_serializing_if = "Option::is_none")]
    pub running_task_count: Option<u32>,
    #[serde(rename = "maxTasks", default, skip_serializing_if = "Option::is_none")]
    pub max_task_count: Option<u32>,
    #[serde(rename = "availableSlots", default, skip_serializing_if = "Option::is_none")]
    pub available_slot_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub hostname: String,
    pub address: IpAddr,
    pub port: u16,
    #[serde(flatten)]
    pub capabilities: NodeCapabilities,
    pub stats: Option<NodeStats>,
    pub last_seen_at: DateTime<Utc>,
    pub discovered_via: DiscoveredVia,
}

impl Node {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.hostname.clone(), self.port)
    }

    pub fn is_high_power(&self) -> bool {
        self.capabilities.total_memory_bytes >= HIGH_POWER_MEMORY_BYTES
    }

    pub fn base_url(&self) -> String {
        match self.address {
            IpAddr::V4(addr) => format!("http://{}:{}", addr, self.port),
            IpAddr::V6(addr) => format!("http://[{}]:{}", addr, self.port),
        }
    }

    pub fn stream_url(&self) -> String {
        match self.address {
            IpAddr::V4(addr) => format!("ws://{}:{}/ws", addr, self.port),
            IpAddr::V6(addr) => format!("ws://[{}]:{}/ws", addr, self.port),
        }
    }

    /// 距最后一次收到报文超过 `stale_after` 即视为离线
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.last_seen_at > stale_after
    }
}

impl NodeStats {
    /// 内存使用率，缺失时由已用/总量推算
    pub fn memory_usage(&self) -> f64 {
        if self.memory_usage_percent > 0.0 || self.memory_total_bytes == 0 {
            return self.memory_usage_percent;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
    }
}
