use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fleet_api::{create_app, AppState};
use fleet_config::AppConfig;
use fleet_core::StatsProvider;
use fleet_discovery::{DiscoveryService, NodeTable};
use fleet_dispatcher::{CapacityScoreStrategy, ClusterManager, PlacementStrategy, TaskManager};
use fleet_infrastructure::{HostStatsProvider, WorkQueueFactory};
use fleet_worker::{SlotCounter, WorkerAgent};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行主节点：发现、调度和 REST API
    Hub,
    /// 仅运行节点 Agent
    Agent,
    /// 同时运行主节点和 Agent
    All,
}

impl AppMode {
    fn runs_hub(self) -> bool {
        matches!(self, AppMode::Hub | AppMode::All)
    }

    fn runs_agent(self) -> bool {
        matches!(self, AppMode::Agent | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hub" => Ok(AppMode::Hub),
            "agent" => Ok(AppMode::Agent),
            "all" => Ok(AppMode::All),
            other => Err(anyhow!("不支持的运行模式: {other}")),
        }
    }
}

/// 已启动的应用
pub struct RunningApp {
    pub api_addr: Option<SocketAddr>,
    pub agent_addr: Option<SocketAddr>,
    pub task_manager: Option<TaskManager>,
    pub table: Option<Arc<NodeTable>>,
    pub handles: Vec<JoinHandle<()>>,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    stats: Option<Arc<dyn StatsProvider>>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        if mode == AppMode::Agent && !config.agent.enabled {
            return Err(anyhow!("Agent 模式被禁用，请检查配置 agent.enabled"));
        }
        Ok(Self {
            config,
            mode,
            stats: None,
        })
    }

    /// 替换默认的主机资源采集实现，Agent 准入与发现广播共用它
    pub fn with_stats_provider(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// 按运行模式启动各组件，所有后台任务都订阅同一个关闭信号
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<RunningApp> {
        info!("启动应用程序，模式: {:?}", self.mode);

        if self.config.observability.metrics_enabled {
            self.install_metrics_exporter()?;
        }

        let mut running = RunningApp {
            api_addr: None,
            agent_addr: None,
            task_manager: None,
            table: None,
            handles: Vec::new(),
        };

        if self.mode.runs_agent() && self.config.agent.enabled {
            let agent = match &self.stats {
                Some(stats) => WorkerAgent::with_stats(
                    self.config.agent.clone(),
                    self.config.discovery.clone(),
                    Arc::new(SlotCounter::new(self.config.agent.max_concurrent_tasks)),
                    Arc::clone(stats),
                ),
                None => WorkerAgent::new(self.config.agent.clone(), self.config.discovery.clone()),
            };
            let agent = agent.start(shutdown).await.context("启动 Agent 失败")?;
            running.agent_addr = Some(agent.local_addr);
            running.handles.extend(agent.handles);
        }

        if self.mode.runs_hub() {
            self.start_hub(shutdown, &mut running).await?;
        }

        Ok(running)
    }

    async fn start_hub(
        &self,
        shutdown: &broadcast::Sender<()>,
        running: &mut RunningApp,
    ) -> Result<()> {
        let stats: Arc<dyn StatsProvider> = match &self.stats {
            Some(stats) => Arc::clone(stats),
            None => Arc::new(HostStatsProvider::new(self.config.discovery.hostname.clone())),
        };
        let hostname = stats.hostname();

        let table = if self.config.discovery.enabled {
            let mut discovery = self.config.discovery.clone();
            // Agent 已经在广播自身
            if running.agent_addr.is_some() {
                discovery.announce = false;
            }
            let service = DiscoveryService::new(discovery, Arc::clone(&stats));
            running.handles.extend(service.start(shutdown).await);
            service.table()
        } else {
            info!("发现服务未启用");
            Arc::new(NodeTable::new(hostname.clone()))
        };

        let task_config = self.config.task_manager.clone();
        if task_config.uses_default_secret() {
            warn!("主节点使用默认集群密钥，请在生产环境中修改 task_manager.cluster_secret");
        }
        let cluster = Arc::new(ClusterManager::new(
            Arc::clone(&table),
            task_config.cluster_secret.clone(),
            Duration::from_secs(task_config.reconnect_backoff_seconds),
        ));
        running.handles.push(cluster.start(shutdown.subscribe()));

        let queue =
            WorkQueueFactory::create(&self.config.queue, &WorkQueueFactory::consumer_name(&hostname))
                .await;
        let placement: Arc<dyn PlacementStrategy> = Arc::new(CapacityScoreStrategy::new());
        let task_manager = TaskManager::new(task_config, cluster, Arc::clone(&placement), queue);

        {
            let task_manager = task_manager.clone();
            let queue_shutdown = shutdown.subscribe();
            running.handles.push(tokio::spawn(async move {
                if let Err(e) = task_manager.start(queue_shutdown).await {
                    error!("任务队列消费异常退出: {e}");
                }
            }));
        }

        if self.config.api.enabled {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("API 无法监听 {}", self.config.api.bind_address))?;
            let local_addr = listener.local_addr()?;
            info!("API 服务监听 {local_addr}");

            let app = create_app(AppState::new(
                task_manager.clone(),
                Arc::clone(&table),
                placement,
            ));
            let mut server_shutdown = shutdown.subscribe();
            running.handles.push(tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = server_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = result {
                    error!("API 服务异常退出: {e}");
                }
                info!("API 服务已停止");
            }));
            running.api_addr = Some(local_addr);
        }

        running.task_manager = Some(task_manager);
        running.table = Some(table);
        Ok(())
    }

    fn install_metrics_exporter(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .observability
            .metrics_bind_address
            .parse()
            .context("无效的 observability.metrics_bind_address")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow!("安装 Prometheus 导出器失败: {e}"))?;
        info!("Prometheus 指标导出监听 {addr}");
        Ok(())
    }
}
