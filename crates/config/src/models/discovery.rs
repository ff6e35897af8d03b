use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

/// 集群发现（存在性协议）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// UDP 监听端口
    pub port: u16,
    /// 主端口被占用时的备用端口
    pub fallback_port: u16,
    /// Agent HTTP 端口，主动扫描时探测
    pub fleet_port: u16,
    /// 覆盖本机主机名（默认读取系统主机名）
    pub hostname: Option<String>,
    pub announce: bool,
    pub active_scan: bool,
    pub announce_interval_seconds: u64,
    pub stats_interval_seconds: u64,
    pub scan_interval_seconds: u64,
    pub expiry_interval_seconds: u64,
    pub stale_after_seconds: u64,
    pub scan_timeout_ms: u64,
    pub scan_concurrency: usize,
    pub health_path: String,
    pub extra_broadcast_targets: Vec<String>,
    /// 单个子网最多扫描的主机数，超过时收缩到本机所在的 /24
    pub max_scan_hosts: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 41234,
            fallback_port: 41235,
            fleet_port: 3100,
            hostname: None,
            announce: true,
            active_scan: true,
            announce_interval_seconds: 5,
            stats_interval_seconds: 10,
            scan_interval_seconds: 30,
            expiry_interval_seconds: 30,
            stale_after_seconds: 60,
            scan_timeout_ms: 2000,
            scan_concurrency: 10,
            health_path: "/health".to_string(),
            extra_broadcast_targets: vec!["255.255.255.255".to_string(), "224.0.0.1".to_string()],
            max_scan_hosts: 1024,
        }
    }
}

impl ConfigValidator for DiscoveryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_port(self.port, "discovery.port")?;
        ValidationUtils::validate_port(self.fallback_port, "discovery.fallback_port")?;
        ValidationUtils::validate_port(self.fleet_port, "discovery.fleet_port")?;
        if self.port == self.fallback_port {
            return Err(crate::ConfigError::Validation(
                "discovery.fallback_port must differ from discovery.port".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.announce_interval_seconds,
            "discovery.announce_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.stats_interval_seconds,
            "discovery.stats_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.scan_interval_seconds,
            "discovery.scan_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.expiry_interval_seconds,
            "discovery.expiry_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.stale_after_seconds,
            "discovery.stale_after_seconds",
        )?;
        if self.scan_timeout_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "discovery.scan_timeout_ms must be greater than 0".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.scan_concurrency, "discovery.scan_concurrency", 256)?;
        ValidationUtils::validate_count(self.max_scan_hosts, "discovery.max_scan_hosts", 65_536)?;
        if !self.health_path.starts_with('/') {
            return Err(crate::ConfigError::Validation(
                "discovery.health_path must start with '/'".to_string(),
            ));
        }
        Ok(())
    }
}
