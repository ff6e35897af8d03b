use std::io::Write;

use tempfile::NamedTempFile;

use crate::{AppConfig, LogFormat};

#[test]
fn test_load_missing_file_fails() {
    let result = AppConfig::load(Some("/definitely/not/here/fleet.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_file_then_env_override() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[discovery]
fleet_port = 3200
scan_interval_seconds = 45

[observability]
log_format = "json"
"#
    )
    .unwrap();

    std::env::set_var("FLEET_TASK_MANAGER__COMMAND_TIMEOUT_SECONDS", "120");
    let config = AppConfig::load(file.path().to_str()).unwrap();
    std::env::remove_var("FLEET_TASK_MANAGER__COMMAND_TIMEOUT_SECONDS");

    assert_eq!(config.discovery.fleet_port, 3200);
    assert_eq!(config.discovery.scan_interval_seconds, 45);
    assert_eq!(config.discovery.port, 41234);
    assert_eq!(config.observability.log_format, LogFormat::Json);
    assert_eq!(config.task_manager.command_timeout_seconds, 120);
}

#[test]
fn test_toml_round_trip_keeps_values() {
    let mut config = AppConfig::default();
    config.agent.max_concurrent_tasks = 7;
    config.queue.enabled = true;

    let text = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.agent.max_concurrent_tasks, 7);
    assert!(parsed.queue.enabled);
}
