use std::net::SocketAddr;

use crate::{ConfigError, ConfigResult};

/// 每个配置段在加载后都要通过校验
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// 最长允许的超时：一天
const MAX_TIMEOUT_SECONDS: u64 = 86_400;

fn invalid(field: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Validation(format!("{field}: {reason}"))
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(invalid(field, "不能为空"));
        }
        Ok(())
    }

    pub fn validate_port(port: u16, field: &str) -> ConfigResult<()> {
        if port == 0 {
            return Err(invalid(field, "端口不能为 0"));
        }
        Ok(())
    }

    pub fn validate_timeout_seconds(seconds: u64, field: &str) -> ConfigResult<()> {
        match seconds {
            0 => Err(invalid(field, "必须大于 0")),
            s if s > MAX_TIMEOUT_SECONDS => {
                Err(invalid(field, format!("不能超过 {MAX_TIMEOUT_SECONDS} 秒")))
            }
            _ => Ok(()),
        }
    }

    /// 取值范围 [1, max]
    pub fn validate_count(count: usize, field: &str, max: usize) -> ConfigResult<()> {
        if count == 0 || count > max {
            return Err(invalid(field, format!("取值范围为 1..={max}，当前为 {count}")));
        }
        Ok(())
    }

    /// 取值范围 (0, 100]
    pub fn validate_percent(value: f64, field: &str) -> ConfigResult<()> {
        if value > 0.0 && value <= 100.0 {
            Ok(())
        } else {
            Err(invalid(field, format!("百分比必须在 (0, 100] 之间，当前为 {value}")))
        }
    }

    pub fn validate_socket_addr(value: &str, field: &str) -> ConfigResult<()> {
        value
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|e| invalid(field, format!("无效的监听地址 {value}: {e}")))
    }

    pub fn validate_url(url: &str, field: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field)?;
        if !url.contains("://") {
            return Err(invalid(field, "URL 必须包含协议前缀"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("", "field").is_err());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(ValidationUtils::validate_port(41234, "port").is_ok());
        assert!(ValidationUtils::validate_port(0, "port").is_err());
    }

    #[test]
    fn test_validate_percent() {
        assert!(ValidationUtils::validate_percent(90.0, "p").is_ok());
        assert!(ValidationUtils::validate_percent(100.0, "p").is_ok());
        assert!(ValidationUtils::validate_percent(0.0, "p").is_err());
        assert!(ValidationUtils::validate_percent(120.0, "p").is_err());
    }

    #[test]
    fn test_validate_socket_addr() {
        assert!(ValidationUtils::validate_socket_addr("0.0.0.0:3100", "bind").is_ok());
        assert!(ValidationUtils::validate_socket_addr("localhost", "bind").is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(ValidationUtils::validate_url("redis://127.0.0.1:6379", "url").is_ok());
        assert!(ValidationUtils::validate_url("", "url").is_err());
        assert!(ValidationUtils::validate_url("127.0.0.1:6379", "url").is_err());
    }
}
