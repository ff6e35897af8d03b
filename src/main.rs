use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info};

use fleet::shutdown::wait_for_signal;
use fleet::{AppMode, Application, ShutdownManager};
use fleet_config::{AppConfig, ConfigValidator, LogFormat};
use fleet_core::logging::init_logging;

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("fleet")
        .version(env!("CARGO_PKG_VERSION"))
        .about("局域网集群发现与任务分发系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["hub", "agent", "all"])
                .default_value("hub"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("hub")
        .parse()?;

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.parse::<LogFormat>()?;
    }
    if mode == AppMode::Agent && !config.agent.enabled {
        config.agent.enabled = true;
        config.validate()?;
    }

    init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    )?;

    info!("启动 fleet，模式: {mode:?}");

    let app = Application::new(config, mode)?;
    let shutdown = ShutdownManager::new(SHUTDOWN_GRACE_PERIOD);
    let running = match app.start(shutdown.sender()).await {
        Ok(running) => running,
        Err(e) => {
            error!("启动失败: {e:#}");
            shutdown.shutdown(Vec::new()).await;
            return Err(e);
        }
    };

    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown.shutdown(running.handles).await;

    info!("fleet 已退出");
    Ok(())
}
