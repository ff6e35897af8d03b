use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use fleet_config::DiscoveryConfig;
use fleet_core::{ClusterAnnounce, DiscoveryMessage, StatsProvider};
use fleet_errors::FleetResult;

use crate::scanner::local_subnets;

/// 周期性广播 `cluster_announce` 与 `cluster_stats`
///
/// hub 与 Agent 都运行它。报文同时发往主端口和备用端口，
/// 退到备用端口的监听者也能收到。
pub struct Announcer {
    socket: UdpSocket,
    stats: Arc<dyn StatsProvider>,
    advertised_port: u16,
    targets: Vec<SocketAddr>,
}

impl Announcer {
    /// `advertised_port` 为本节点对外提供 HTTP 服务的端口
    pub async fn new(
        config: &DiscoveryConfig,
        stats: Arc<dyn StatsProvider>,
        advertised_port: u16,
    ) -> FleetResult<Self> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for target in &config.extra_broadcast_targets {
            match target.parse::<IpAddr>() {
                Ok(ip) => addresses.push(ip),
                Err(e) => warn!("忽略无效的广播目标 {target}: {e}"),
            }
        }
        for range in local_subnets(usize::MAX) {
            let broadcast = IpAddr::V4(range.broadcast());
            if !addresses.contains(&broadcast) {
                addresses.push(broadcast);
            }
        }

        let ports = [config.port, config.fallback_port];
        let targets = addresses
            .iter()
            .flat_map(|ip| ports.iter().map(move |port| SocketAddr::new(*ip, *port)))
            .collect();

        Self::with_targets(stats, advertised_port, targets).await
    }

    pub async fn with_targets(
        stats: Arc<dyn StatsProvider>,
        advertised_port: u16,
        targets: Vec<SocketAddr>,
    ) -> FleetResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            stats,
            advertised_port,
            targets,
        })
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    pub async fn announce_once(&self) -> FleetResult<()> {
        let message = DiscoveryMessage::ClusterAnnounce(ClusterAnnounce::new(
            self.stats.hostname(),
            self.advertised_port,
            &self.stats.capabilities(),
        ));
        self.send(&message.encode()?).await;
        Ok(())
    }

    pub async fn stats_once(&self) -> FleetResult<()> {
        let message =
            DiscoveryMessage::stats(self.stats.hostname(), self.advertised_port, self.stats.stats());
        self.send(&message.encode()?).await;
        Ok(())
    }

    /// 尽力发送，权限错误静默忽略
    async fn send(&self, payload: &[u8]) {
        for target in &self.targets {
            match self.socket.send_to(payload, target).await {
                Ok(n) => trace!("发现报文已发送到 {target} ({n} bytes)"),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    trace!("无权限向 {target} 广播: {e}");
                }
                Err(e) => debug!("向 {target} 发送发现报文失败: {e}"),
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        announce_interval: Duration,
        stats_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            "节点广播已启动: port={}, 目标数={}",
            self.advertised_port,
            self.targets.len()
        );
        let mut announce_tick = tokio::time::interval(announce_interval);
        let mut stats_tick = tokio::time::interval(stats_interval);
        announce_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = announce_tick.tick() => {
                    if let Err(e) = self.announce_once().await {
                        warn!("生成 announce 报文失败: {e}");
                    }
                }
                _ = stats_tick.tick() => {
                    if let Err(e) = self.stats_once().await {
                        warn!("生成 stats 报文失败: {e}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("节点广播停止");
                    break;
                }
            }
        }
    }
}
