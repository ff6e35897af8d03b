use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 所有后台循环订阅同一个广播信号，触发后在限定时间内等待它们退出。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new(grace_period: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            grace_period,
        }
    }

    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.shutdown_tx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 发送关闭信号，并等待后台任务退出
    ///
    /// 返回在宽限期内结束的任务数。
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) -> usize {
        debug!("发送关闭信号给 {} 个订阅者", self.shutdown_tx.receiver_count());
        // 没有订阅者时发送失败，可以忽略
        let _ = self.shutdown_tx.send(());

        let total = handles.len();
        let deadline = tokio::time::Instant::now() + self.grace_period;
        let mut finished = 0;
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => finished += 1,
                Ok(Err(e)) => warn!("后台任务异常结束: {e}"),
                Err(_) => {
                    warn!("关闭超时，{} 个后台任务未能按时退出", total - finished);
                    return finished;
                }
            }
        }
        info!("全部 {total} 个后台任务已退出");
        finished
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_subscribers() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let mut rx = manager.subscribe();
        let handle = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        assert_eq!(manager.shutdown(vec![handle]).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_after_grace_period() {
        let manager = ShutdownManager::new(Duration::from_millis(50));
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        assert_eq!(manager.shutdown(vec![stuck]).await, 0);
    }
}
