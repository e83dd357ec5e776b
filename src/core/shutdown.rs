//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发同一个 CancellationToken：HTTP 服务停止接收 Webhook，
//! 不活跃巡检任务在下一次 tick 前退出。

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭原因（第一次触发的原因生效）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM（容器平台重启 / 缩容）
    Terminate,
    /// 服务自行结束（监听出错等）
    ServerStopped,
}

#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 交给后台任务的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 监听 Ctrl+C 与 SIGTERM，收到后触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let Ok(mut term) = signal(SignalKind::terminate()) else {
                    tracing::warn!("Unable to listen for SIGTERM");
                    return;
                };
                term.recv().await;
                tracing::info!("SIGTERM received, shutting down");
                manager.shutdown(ShutdownReason::Terminate);
            });
        }
    }
}

/// 运行服务直到它自行结束或收到关闭信号；之后取消 token 并执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    server: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();
    let token = manager.token();

    tokio::select! {
        _ = server => manager.shutdown(ShutdownReason::ServerStopped),
        _ = token.cancelled() => {}
    }
    tracing::info!(reason = ?manager.reason(), "Stopping background tasks");

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_server_exit_cancels_token_and_cleans_up() {
        let manager = Arc::new(ShutdownManager::new());
        let token = manager.token();
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        run_with_graceful_shutdown(manager.clone(), async {}, || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(token.is_cancelled());
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(manager.reason(), Some(ShutdownReason::ServerStopped));
    }
}
