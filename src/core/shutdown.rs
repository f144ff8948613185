//! 优雅关闭
//!
//! 统一监听 Ctrl+C / SIGTERM，收到信号后依次执行注册的清理任务：
//! - 停止干预轮询，丢弃进行中的 tick
//! - 取消 Butler 处理中的任务并等待并发槽位释放
//!
//! 每个清理任务都有超时，单个任务失败或超时只记日志。
//! 会话过期且刷新失败时，无头运行已无法继续，以 `FatalError` 触发关闭。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::{GatewayEvent, RequestGateway};
use crate::butler::ButlerQueue;
use crate::core::Subscription;
use crate::interventions::InterventionMonitor;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 运行中出现无法恢复的错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token，可派生子 token 交给长时间运行的任务
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复调用只有第一次广播原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 订阅关闭原因；只会收到订阅之后的第一次关闭
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 网关报告会话过期时以 `FatalError` 触发关闭
    pub fn shutdown_on_session_expiry(self: &Arc<Self>, gateway: &RequestGateway) -> Subscription {
        let manager = Arc::clone(self);
        gateway.subscribe(move |event| {
            if *event == GatewayEvent::SessionExpired {
                tracing::error!("Session expired and could not be refreshed");
                manager.shutdown(ShutdownReason::FatalError("session expired".to_string()));
            }
        })
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行全部清理，返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let mut succeeded = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    succeeded += 1;
                    tracing::info!("Cleanup task '{}' completed", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {:#}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
        succeeded
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止干预轮询
pub struct MonitorCleanup {
    monitor: InterventionMonitor,
}

impl MonitorCleanup {
    pub fn new(monitor: InterventionMonitor) -> Self {
        Self { monitor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MonitorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.monitor.stop();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InterventionMonitor"
    }
}

/// 取消 Butler 任务，并等待处理中的任务释放槽位
pub struct ButlerCleanup {
    queue: ButlerQueue,
    poll: Duration,
}

impl ButlerCleanup {
    pub fn new(queue: ButlerQueue) -> Self {
        Self {
            queue,
            poll: Duration::from_millis(50),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ButlerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.queue.shutdown();
        while self.queue.stats().processing > 0 {
            tokio::time::sleep(self.poll).await;
        }
        let stats = self.queue.stats();
        if stats.queued > 0 {
            anyhow::bail!("{} butler actions still queued at shutdown", stats.queued);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ButlerQueue"
    }
}

/// 运行主应用直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
