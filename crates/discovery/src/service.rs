use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::Networks;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_config::DiscoveryConfig;
use fleet_core::StatsProvider;

use crate::announcer::Announcer;
use crate::node_table::NodeTable;
use crate::scanner::{local_subnets, Scanner};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// hub 侧的发现服务
///
/// 包含四个后台循环：被动监听、主动扫描、过期清理，以及可选的自身广播。
pub struct DiscoveryService {
    config: DiscoveryConfig,
    table: Arc<NodeTable>,
    stats: Arc<dyn StatsProvider>,
    scanner: Arc<Scanner>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, stats: Arc<dyn StatsProvider>) -> Self {
        let table = Arc::new(NodeTable::new(stats.hostname()));
        let scanner = Arc::new(Scanner::new(
            config.fleet_port,
            config.health_path.clone(),
            Duration::from_millis(config.scan_timeout_ms),
            config.scan_concurrency,
        ));
        Self {
            config,
            table,
            stats,
            scanner,
        }
    }

    pub fn table(&self) -> Arc<NodeTable> {
        Arc::clone(&self.table)
    }

    /// 绑定监听端口，失败时尝试一次备用端口
    pub async fn bind_listener(port: u16, fallback_port: u16) -> Option<UdpSocket> {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => return Some(socket),
            Err(e) => warn!("发现端口 {port} 绑定失败，尝试备用端口 {fallback_port}: {e}"),
        }
        match UdpSocket::bind(("0.0.0.0", fallback_port)).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                error!("发现服务无法绑定端口 {port} 或 {fallback_port}，被动发现不可用: {e}");
                None
            }
        }
    }

    /// 启动全部后台循环
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        match Self::bind_listener(self.config.port, self.config.fallback_port).await {
            Some(socket) => {
                if let Ok(addr) = socket.local_addr() {
                    info!("发现服务监听 {addr}");
                }
                let table = Arc::clone(&self.table);
                handles.push(tokio::spawn(listen_loop(
                    socket,
                    table,
                    shutdown.subscribe(),
                )));
            }
            None => warn!("发现服务将仅依赖主动扫描"),
        }

        if self.config.active_scan {
            handles.push(tokio::spawn(scan_loop(
                Arc::clone(&self.scanner),
                Arc::clone(&self.table),
                self.config.max_scan_hosts,
                Duration::from_secs(self.config.scan_interval_seconds),
                shutdown.subscribe(),
            )));
        }

        handles.push(tokio::spawn(expiry_loop(
            Arc::clone(&self.table),
            Duration::from_secs(self.config.expiry_interval_seconds),
            chrono::Duration::seconds(self.config.stale_after_seconds as i64),
            shutdown.subscribe(),
        )));

        if self.config.announce {
            match Announcer::new(&self.config, Arc::clone(&self.stats), self.config.fleet_port).await
            {
                Ok(announcer) => handles.push(tokio::spawn(Arc::new(announcer).run(
                    Duration::from_secs(self.config.announce_interval_seconds),
                    Duration::from_secs(self.config.stats_interval_seconds),
                    shutdown.subscribe(),
                ))),
                Err(e) => warn!("节点广播启动失败: {e}"),
            }
        }

        handles
    }
}

async fn listen_loop(
    socket: UdpSocket,
    table: Arc<NodeTable>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => table.handle_datagram(&buf[..n], from).await,
                Err(e) => {
                    debug!("接收发现报文失败: {e}");
                }
            },
            _ = shutdown.recv() => {
                info!("发现监听停止");
                break;
            }
        }
    }
}

fn local_ipv4_addresses() -> HashSet<Ipv4Addr> {
    let networks = Networks::new_with_refreshed_list();
    networks
        .list()
        .values()
        .flat_map(|data| data.ip_networks().iter())
        .filter_map(|net| match net.addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect()
}

async fn scan_subnets(scanner: &Arc<Scanner>, table: &Arc<NodeTable>, max_hosts: usize) -> usize {
    let exclude = local_ipv4_addresses();
    let mut added = 0;
    for range in local_subnets(max_hosts) {
        let targets = range.hosts(&exclude);
        debug!(
            "扫描网段 {}/{} ({} 个地址)",
            range.network(),
            range.prefix,
            targets.len()
        );
        added += scanner.scan(targets, table).await;
    }
    added
}

async fn scan_loop(
    scanner: Arc<Scanner>,
    table: Arc<NodeTable>,
    max_hosts: usize,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let added = tokio::select! {
                    added = scan_subnets(&scanner, &table, max_hosts) => added,
                    _ = shutdown.recv() => break,
                };
                if added > 0 {
                    info!("主动扫描发现 {added} 个新节点");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    info!("主动扫描停止");
}

async fn expiry_loop(
    table: Arc<NodeTable>,
    period: Duration,
    stale_after: chrono::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                table.expire(Utc::now(), stale_after).await;
            }
            _ = shutdown.recv() => break,
        }
    }
    info!("节点过期清理停止");
}
