//! Phoenix - 无头运行器
//!
//! 入口：初始化日志、加载配置、构建上下文、恢复会话并启动干预监控，
//! 收到 Ctrl+C / SIGTERM 或会话过期后停止轮询、取消 Butler 任务并执行清理。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use phoenix::butler::ButlerEvent;
use phoenix::config::load_config;
use phoenix::core::shutdown::{
    run_with_graceful_shutdown, ButlerCleanup, MonitorCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
use phoenix::core::ContextBuilder;
use phoenix::interventions::InterventionEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    phoenix::observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    let ctx = ContextBuilder::new(config)
        .build()
        .context("Failed to build Phoenix context")?;

    let restored = ctx
        .gateway
        .restore_session()
        .await
        .context("Failed to restore saved session")?;
    if !restored {
        tracing::warn!("No saved session; authenticated calls will fail until login");
    }

    let manager = Arc::new(ShutdownManager::new());
    let mut reasons = manager.subscribe();
    let _ = manager.shutdown_on_session_expiry(&ctx.gateway);

    let _ = ctx.butler.subscribe(|event| match event {
        ButlerEvent::Failed { task, error } => {
            tracing::warn!(task_id = %task.id, %error, "[butler] {}", event.event_type())
        }
        other => tracing::info!(task_id = %other.task().id, "[butler] {}", other.event_type()),
    });
    let _ = ctx.interventions.subscribe(|event| match event {
        InterventionEvent::NewPending(i) => {
            tracing::info!(intervention_id = %i.id, kind = ?i.kind, confidence = i.confidence, "New intervention")
        }
        InterventionEvent::Approved { intervention, auto } => {
            tracing::info!(intervention_id = %intervention.id, auto, "Intervention approved")
        }
        other => tracing::debug!("[interventions] {}", other.event_type()),
    });

    ctx.interventions.start_default();

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager)).with_timeout(Duration::from_secs(5));
    coordinator.register(MonitorCleanup::new(ctx.interventions.clone()));
    coordinator.register(ButlerCleanup::new(ctx.butler.clone()));

    run_with_graceful_shutdown(manager, std::future::pending::<()>(), move || async move {
        coordinator.run_cleanup().await;
    })
    .await;

    tracing::info!(stats = ?ctx.butler.stats(), "Phoenix stopped");
    match reasons.try_recv() {
        Ok(ShutdownReason::FatalError(reason)) => anyhow::bail!("Phoenix stopped after fatal error: {}", reason),
        _ => Ok(()),
    }
}
