use crate::*;

#[test]
fn test_fleet_error_display() {
    let transport = FleetError::Transport("connection refused".to_string());
    assert_eq!(transport.to_string(), "网络传输错误: connection refused");

    let admission = FleetError::Admission("4/4 slots in use".to_string());
    assert_eq!(admission.to_string(), "准入拒绝: 4/4 slots in use");

    let not_found = FleetError::task_not_found("abc");
    assert_eq!(not_found.to_string(), "任务未找到: abc");

    let node = FleetError::node_not_found("builder:3100");
    assert_eq!(node.to_string(), "节点未找到: builder:3100");
}

#[test]
fn test_retryable_classification() {
    assert!(FleetError::Transport("x".into()).is_retryable());
    assert!(FleetError::Queue("x".into()).is_retryable());
    assert!(FleetError::Timeout("x".into()).is_retryable());
    assert!(!FleetError::Admission("x".into()).is_retryable());
    assert!(!FleetError::Authorization("x".into()).is_retryable());
    assert!(!FleetError::Execution("x".into()).is_retryable());
}

#[test]
fn test_fatal_classification() {
    assert!(FleetError::Internal("x".into()).is_fatal());
    assert!(FleetError::config_error("x").is_fatal());
    assert!(!FleetError::Protocol("x".into()).is_fatal());
}

#[test]
fn test_user_message() {
    assert_eq!(
        FleetError::NothingToCancel("t1".into()).user_message(),
        "任务已结束，无需取消"
    );
    assert_eq!(
        FleetError::Protocol("bad json".into()).user_message(),
        "系统繁忙，请稍后重试"
    );
}

#[test]
fn test_from_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: FleetError = json_err.into();
    assert!(matches!(err, FleetError::Serialization(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: FleetError = io_err.into();
    assert!(matches!(err, FleetError::Io(_)));

    let err: FleetError = anyhow::anyhow!("boom").into();
    assert!(matches!(err, FleetError::Internal(_)));
}
