use fleet_config::LogFormat;
use fleet_errors::{FleetError, FleetResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先于传入的日志级别。
pub fn init_logging(log_level: &str, log_format: LogFormat) -> FleetResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| FleetError::config_error(format!("初始化JSON日志格式失败: {e}")))?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| FleetError::config_error(format!("初始化Pretty日志格式失败: {e}")))?,
    }

    Ok(())
}
