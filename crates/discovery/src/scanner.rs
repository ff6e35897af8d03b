use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::Networks;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use fleet_core::{DiscoveredVia, HealthResponse, NodeCapabilities, NodeStats};

use crate::node_table::NodeTable;

/// 本机某个 IPv4 接口所在的网段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanRange {
    pub local: Ipv4Addr,
    pub prefix: u8,
}

impl ScanRange {
    pub fn new(local: Ipv4Addr, prefix: u8) -> Self {
        Self {
            local,
            prefix: prefix.min(32),
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.local) & self.mask())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.local) | !self.mask())
    }

    /// 可用主机数（不含网络地址与广播地址）
    pub fn host_count(&self) -> u64 {
        let size = 1u64 << (32 - self.prefix as u32);
        size.saturating_sub(2)
    }

    /// 超过上限的网段收缩到本机所在的 /24
    pub fn bounded(self, max_hosts: usize) -> Self {
        if self.prefix < 24 && self.host_count() > max_hosts as u64 {
            Self::new(self.local, 24)
        } else {
            self
        }
    }

    /// 网段内除本机地址外的所有主机地址
    pub fn hosts(&self, exclude: &HashSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
        if self.prefix >= 31 {
            return Vec::new();
        }
        let network = u32::from(self.network());
        let broadcast = u32::from(self.broadcast());
        ((network + 1)..broadcast)
            .map(Ipv4Addr::from)
            .filter(|ip| *ip != self.local && !exclude.contains(ip))
            .collect()
    }
}

/// 枚举本机非回环 IPv4 接口的网段
pub fn local_subnets(max_hosts: usize) -> Vec<ScanRange> {
    let networks = Networks::new_with_refreshed_list();
    let mut ranges = Vec::new();
    for (name, data) in networks.list() {
        for net in data.ip_networks() {
            let IpAddr::V4(addr) = net.addr else {
                continue;
            };
            if addr.is_loopback() || addr.is_link_local() || addr.is_unspecified() {
                continue;
            }
            let range = ScanRange::new(addr, net.prefix).bounded(max_hosts);
            if !ranges.contains(&range) {
                debug!("接口 {name}: {}/{}", range.network(), range.prefix);
                ranges.push(range);
            }
        }
    }
    ranges
}

/// 主动扫描器
///
/// 向网段内每个地址的 fleet 端口发起 HTTP 健康检查，
/// 并发数受信号量限制，每个探测都有独立超时。
pub struct Scanner {
    client: reqwest::Client,
    port: u16,
    health_path: String,
    concurrency: usize,
}

impl Scanner {
    pub fn new(port: u16, health_path: impl Into<String>, timeout: Duration, concurrency: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("创建扫描 HTTP 客户端失败，使用默认配置: {e}");
                reqwest::Client::new()
            });
        Self {
            client,
            port,
            health_path: health_path.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// 探测单个地址，成功时返回健康信息与可选的 stats
    pub async fn check_host(&self, ip: IpAddr) -> Option<(HealthResponse, Option<NodeStats>)> {
        let base = match ip {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.port),
        };

        let response = self
            .client
            .get(format!("{base}{}", self.health_path))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let health: HealthResponse = response.json().await.ok()?;

        let stats = match self.client.get(format!("{base}/stats")).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<NodeStats>().await.ok(),
            _ => None,
        };
        Some((health, stats))
    }

    /// 扫描地址列表，命中的节点写入节点表，返回新增节点数
    pub async fn scan(self: &Arc<Self>, targets: Vec<Ipv4Addr>, table: &Arc<NodeTable>) -> usize {
        if targets.is_empty() {
            return 0;
        }
        debug!("开始扫描 {} 个地址", targets.len());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(targets.len());
        for ip in targets {
            let semaphore = Arc::clone(&semaphore);
            let scanner = Arc::clone(self);
            let table = Arc::clone(table);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let (health, stats) = scanner.check_host(IpAddr::V4(ip)).await?;
                let capabilities = NodeCapabilities {
                    platform: health.platform.clone().unwrap_or_else(|| "unknown".to_string()),
                    arch: health.arch.clone().unwrap_or_else(|| "unknown".to_string()),
                    cpu_count: health.cpus.unwrap_or(0),
                    total_memory_bytes: health
                        .total_memory
                        .or_else(|| stats.as_ref().map(|s| s.memory_total_bytes))
                        .unwrap_or(0),
                };
                let added = table
                    .upsert(
                        &health.hostname,
                        IpAddr::V4(ip),
                        scanner.port,
                        capabilities,
                        stats,
                        DiscoveredVia::ActiveScan,
                    )
                    .await;
                Some(added)
            }));
        }

        let mut added = 0;
        for handle in handles {
            if let Ok(Some(true)) = handle.await {
                added += 1;
            }
        }
        debug!("扫描完成，新增 {added} 个节点");
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_24() {
        let range = ScanRange::new(Ipv4Addr::new(192, 168, 1, 10), 24);
        assert_eq!(range.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(range.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        let hosts = range.hosts(&HashSet::new());
        assert_eq!(hosts.len(), 253);
        assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(*hosts.last().unwrap(), Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_range_excludes_other_local_addresses() {
        let range = ScanRange::new(Ipv4Addr::new(10, 0, 0, 1), 29);
        let exclude: HashSet<Ipv4Addr> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();
        let hosts = range.hosts(&exclude);
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 4),
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(10, 0, 0, 6),
            ]
        );
    }

    #[test]
    fn test_large_subnet_shrinks_to_24() {
        let range = ScanRange::new(Ipv4Addr::new(10, 1, 2, 3), 16).bounded(1024);
        assert_eq!(range.prefix, 24);
        assert_eq!(range.network(), Ipv4Addr::new(10, 1, 2, 0));

        let small = ScanRange::new(Ipv4Addr::new(10, 1, 2, 3), 22).bounded(1024);
        assert_eq!(small.prefix, 22);
    }

    #[test]
    fn test_point_to_point_has_no_hosts() {
        let range = ScanRange::new(Ipv4Addr::new(10, 0, 0, 1), 32);
        assert!(range.hosts(&HashSet::new()).is_empty());
        assert_eq!(range.broadcast(), Ipv4Addr::new(10, 0, 0, 1));
    }
}
