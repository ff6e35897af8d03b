use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fleet_config::{AgentConfig, DiscoveryConfig};
use fleet_core::StatsProvider;
use fleet_discovery::Announcer;
use fleet_errors::{FleetError, FleetResult};
use fleet_infrastructure::HostStatsProvider;

use crate::admission::{AdmissionController, SlotCounter};
use crate::executor::JobManager;
use crate::http::{create_routes, AgentState};
use crate::job_store::JobStore;

/// 已启动的 Agent
pub struct RunningAgent {
    pub local_addr: SocketAddr,
    pub handles: Vec<JoinHandle<()>>,
}

/// 节点 Agent：HTTP/WebSocket 服务 + 在线广播
pub struct WorkerAgent {
    config: AgentConfig,
    discovery: DiscoveryConfig,
    stats: Arc<dyn StatsProvider>,
    jobs: Arc<JobManager>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig, discovery: DiscoveryConfig) -> Self {
        let slots = Arc::new(SlotCounter::new(config.max_concurrent_tasks));
        let stats: Arc<dyn StatsProvider> = Arc::new(
            HostStatsProvider::new(discovery.hostname.clone()).with_slots(slots.clone()),
        );
        Self::with_stats(config, discovery, slots, stats)
    }

    /// 使用指定的资源采集实现构建
    pub fn with_stats(
        config: AgentConfig,
        discovery: DiscoveryConfig,
        slots: Arc<SlotCounter>,
        stats: Arc<dyn StatsProvider>,
    ) -> Self {
        let admission = AdmissionController::new(&config, slots, Arc::clone(&stats));
        let jobs = Arc::new(
            JobManager::new(
                admission,
                JobStore::new(&config.jobs_dir),
                config.max_output_bytes,
            )
            .with_retention(config.max_finished_jobs),
        );
        Self {
            config,
            discovery,
            stats,
            jobs,
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn router(&self) -> Router {
        create_routes(AgentState::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.stats),
            &self.config.secret,
        ))
    }

    /// 恢复作业目录、启动 HTTP 服务，并按配置开启在线广播
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> FleetResult<RunningAgent> {
        if self.config.uses_default_secret() {
            warn!("Agent 使用默认集群密钥，请在生产环境中修改 agent.secret");
        }

        match self.jobs.store().recover().await {
            Ok(0) => {}
            Ok(n) => info!("已恢复 {n} 个中断的作业记录"),
            Err(e) => warn!("恢复作业目录失败: {e}"),
        }

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                FleetError::config_error(format!(
                    "Agent 无法监听 {}: {e}",
                    self.config.bind_address
                ))
            })?;
        let local_addr = listener.local_addr()?;
        info!("Agent 监听 {local_addr}");

        let mut handles = Vec::new();
        let app = self.router();
        let mut server_shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("Agent HTTP 服务异常退出: {e}");
            }
            info!("Agent HTTP 服务已停止");
        }));

        if self.discovery.enabled && self.discovery.announce {
            match Announcer::new(&self.discovery, Arc::clone(&self.stats), local_addr.port()).await {
                Ok(announcer) => handles.push(tokio::spawn(Arc::new(announcer).run(
                    Duration::from_secs(self.discovery.announce_interval_seconds),
                    Duration::from_secs(self.discovery.stats_interval_seconds),
                    shutdown.subscribe(),
                ))),
                Err(e) => warn!("Agent 在线广播启动失败: {e}"),
            }
        }

        Ok(RunningAgent {
            local_addr,
            handles,
        })
    }
}
