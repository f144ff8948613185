//! 干预监控器：定时轮询、自动审批、生命周期事件
//!
//! 状态机：`pending --approve--> active`，`pending --reject--> 移除`，`active --dismiss--> 移除`。
//!
//! 轮询是一个可取消的调度任务：上一次 tick 结束后才开始等待下一个间隔，
//! 并且与 `check_now` 共用 tick 锁，任意时刻最多只有一个 tick 在执行。
//! 每次 tick 用远端结果整体替换本地集合，再对达到阈值的待处理项自动审批，
//! 最后为尚未通知过的待处理项发出通知。`notified` 记录在本地，只增不减。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::source::InterventionSource;
use super::types::{Intervention, InterventionStatus};
use crate::config::AppConfig;
use crate::core::{EventBus, GatewayError, InterventionError, Subscription};

/// 监控参数
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub auto_approve_threshold: f64,
    pub notifications_enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            auto_approve_threshold: 0.95,
            notifications_enabled: true,
        }
    }
}

impl From<&AppConfig> for MonitorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interventions.check_interval_ms),
            auto_approve_threshold: config.interventions.auto_approve_threshold,
            notifications_enabled: config.interventions.notifications_enabled,
        }
    }
}

/// 监控事件
#[derive(Debug, Clone)]
pub enum InterventionEvent {
    PendingLoaded(Vec<Intervention>),
    ActiveLoaded(Vec<Intervention>),
    /// 新出现的待处理项（每个 id 至多一次）
    NewPending(Intervention),
    Approved { intervention: Intervention, auto: bool },
    Rejected { intervention: Intervention, reason: String },
    Dismissed(Intervention),
    /// 交互式决策失败，供界面弹出提示
    DecisionFailed { id: String, action: &'static str, error: GatewayError },
}

impl InterventionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InterventionEvent::PendingLoaded(_) => "pending-loaded",
            InterventionEvent::ActiveLoaded(_) => "active-loaded",
            InterventionEvent::NewPending(_) => "new-pending",
            InterventionEvent::Approved { .. } => "approved",
            InterventionEvent::Rejected { .. } => "rejected",
            InterventionEvent::Dismissed(_) => "dismissed",
            InterventionEvent::DecisionFailed { .. } => "decision-failed",
        }
    }
}

/// 单次 tick 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pending: usize,
    pub active: usize,
    pub auto_approved: usize,
    pub notified: usize,
}

#[derive(Default)]
struct MonitorState {
    pending: Vec<Intervention>,
    active: Vec<Intervention>,
    /// `notified` 与 `auto_approved` 只增不减，随监控器生命周期存在，不做清理
    notified: HashSet<String>,
    auto_approved: HashSet<String>,
    /// 决策请求进行中的 id
    deciding: HashSet<String>,
}

struct PollJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: MonitorConfig,
    source: Arc<dyn InterventionSource>,
    state: Mutex<MonitorState>,
    events: EventBus<InterventionEvent>,
    tick_lock: tokio::sync::Mutex<()>,
    /// 发布闸：tick 的“检查取消→写状态/发事件”整体在闸内执行，`stop` 取消前先拿闸
    publish_gate: Mutex<()>,
    /// 当前持有发布闸的线程，监听器内调用 `stop` 时据此避免自锁
    publisher: Mutex<Option<ThreadId>>,
    job: Mutex<Option<PollJob>>,
}

/// 干预监控器；克隆共享同一状态
#[derive(Clone)]
pub struct InterventionMonitor {
    inner: Arc<Inner>,
}

impl InterventionMonitor {
    pub fn new(config: MonitorConfig, source: Arc<dyn InterventionSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                state: Mutex::new(MonitorState::default()),
                events: EventBus::new(),
                tick_lock: tokio::sync::Mutex::new(()),
                publish_gate: Mutex::new(()),
                publisher: Mutex::new(None),
                job: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InterventionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// 以配置的间隔启动轮询
    pub fn start_default(&self) {
        self.start(self.inner.config.interval);
    }

    /// 启动轮询：立即执行一次 tick，之后每次 tick 结束再等待 `interval`
    ///
    /// 已在运行时先停止旧的调度任务。需在 tokio 运行时内调用。
    pub fn start(&self, interval: Duration) {
        self.stop();

        // 持有 job 锁再派生任务，首个 tick 里的 stop 一定能看到这个 job
        let mut job = self.inner.job();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(Arc::downgrade(&self.inner), interval, cancel.clone()));
        *job = Some(PollJob { cancel, handle });
        drop(job);
        tracing::info!(?interval, "Intervention monitoring started");
    }

    /// 停止轮询；未运行时为空操作并返回 false
    ///
    /// 进行中的 tick 被取消：返回之后它不再写入本地状态，也不再发出事件。
    /// 若另一线程正在向监听器发布事件，会等这一批发布结束后再返回。
    pub fn stop(&self) -> bool {
        let Some(job) = self.inner.job().take() else {
            return false;
        };
        if *self.inner.publisher() == Some(thread::current().id()) {
            // 监听器内部调用：本线程已持有发布闸，后续发布会看到取消
            job.cancel.cancel();
        } else {
            let _gate = self.inner.gate();
            job.cancel.cancel();
        }
        job.handle.abort();
        tracing::info!("Intervention monitoring stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.job().is_some()
    }

    /// 手动执行一次 tick（与轮询共用单飞锁）
    pub async fn check_now(&self) -> Result<TickReport, GatewayError> {
        self.inner.tick(None).await
    }

    pub fn get_pending(&self) -> Vec<Intervention> {
        self.inner.state().pending.clone()
    }

    pub fn get_active(&self) -> Vec<Intervention> {
        self.inner.state().active.clone()
    }

    /// 审批；本地已不在待处理列表时为空操作，返回 Ok(false)
    pub async fn approve(&self, id: &str) -> Result<bool, InterventionError> {
        self.inner.approve(id, false, None).await
    }

    /// 拒绝；本地已不在待处理列表时为空操作
    pub async fn reject(&self, id: &str, reason: &str) -> Result<bool, InterventionError> {
        let Some((intervention, _guard)) = self.inner.begin_decision(id, InterventionStatus::Pending) else {
            return Ok(false);
        };

        if let Err(error) = self.inner.source.reject(id, reason).await {
            return Err(self.inner.decision_failed(id, "reject", error));
        }

        self.inner.publish(None, || {
            self.inner.state().pending.retain(|i| i.id != id);
            let removed = Intervention {
                status: InterventionStatus::Rejected,
                ..intervention
            };
            tracing::info!(intervention_id = id, reason, "Intervention rejected");
            self.inner.events.emit(&InterventionEvent::Rejected {
                intervention: removed,
                reason: reason.to_string(),
            });
        });
        Ok(true)
    }

    /// 忽略进行中的干预；本地已不在活动列表时为空操作
    pub async fn dismiss(&self, id: &str) -> Result<bool, InterventionError> {
        let Some((intervention, _guard)) = self.inner.begin_decision(id, InterventionStatus::Active) else {
            return Ok(false);
        };

        if let Err(error) = self.inner.source.dismiss(id).await {
            return Err(self.inner.decision_failed(id, "dismiss", error));
        }

        self.inner.publish(None, || {
            self.inner.state().active.retain(|i| i.id != id);
            let removed = Intervention {
                status: InterventionStatus::Dismissed,
                ..intervention
            };
            tracing::info!(intervention_id = id, "Intervention dismissed");
            self.inner.events.emit(&InterventionEvent::Dismissed(removed));
        });
        Ok(true)
    }
}

async fn poll_loop(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    loop {
        let Some(monitor) = inner.upgrade() else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = monitor.tick(Some(&cancel)) => match result {
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Intervention poll failed; retrying next tick");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Intervention poll rejected; retrying next tick");
                }
                Ok(_) => {}
            }
        }
        drop(monitor);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// 决策进行中标记，离开作用域（包括被取消）时清除
struct DecisionGuard<'a> {
    inner: &'a Inner,
    id: String,
}

impl Drop for DecisionGuard<'_> {
    fn drop(&mut self) {
        self.inner.state().deciding.remove(&self.id);
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn job(&self) -> std::sync::MutexGuard<'_, Option<PollJob>> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.publish_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publisher(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        self.publisher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 在发布闸内执行 `apply`；`cancel` 已触发时放弃并返回 None
    ///
    /// 监听器在闸内被调用但不持有状态锁，可以读取快照或调用 `stop`。
    fn publish<T>(&self, cancel: Option<&CancellationToken>, apply: impl FnOnce() -> T) -> Option<T> {
        let _gate = self.gate();
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return None;
        }
        let previous = self.publisher().replace(thread::current().id());
        let out = apply();
        *self.publisher() = previous;
        Some(out)
    }

    async fn tick(&self, cancel: Option<&CancellationToken>) -> Result<TickReport, GatewayError> {
        let _single_flight = self.tick_lock.lock().await;
        let cancelled = || cancel.is_some_and(|c| c.is_cancelled());

        let (pending, active) =
            futures_util::future::try_join(self.source.fetch_pending(), self.source.fetch_active()).await?;

        let mut report = TickReport::default();
        let loaded = self.publish(cancel, || {
            let (pending, active) = {
                let mut state = self.state();
                let notified = &state.notified;
                let mark = |mut i: Intervention| {
                    i.notified = i.notified || notified.contains(&i.id);
                    i
                };
                let pending: Vec<Intervention> = pending.into_iter().map(mark).collect();
                let active: Vec<Intervention> = active.into_iter().map(mark).collect();
                state.pending = pending.clone();
                state.active = active.clone();
                (pending, active)
            };
            tracing::debug!(pending = pending.len(), active = active.len(), "Interventions refreshed");
            self.events.emit(&InterventionEvent::PendingLoaded(pending.clone()));
            let active_count = active.len();
            self.events.emit(&InterventionEvent::ActiveLoaded(active));
            (pending, active_count)
        });
        let Some((pending, active_count)) = loaded else {
            return Ok(report);
        };
        report.pending = pending.len();
        report.active = active_count;

        let candidates: Vec<String> = {
            let state = self.state();
            pending
                .iter()
                .filter(|i| i.qualifies_for_auto_approval(self.config.auto_approve_threshold))
                .filter(|i| !state.auto_approved.contains(&i.id))
                .map(|i| i.id.clone())
                .collect()
        };
        for id in candidates {
            if cancelled() {
                return Ok(report);
            }
            match self.approve(&id, true, cancel).await {
                Ok(true) => report.auto_approved += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(intervention_id = %id, error = %e, "Auto-approval failed; retrying next tick"),
            }
        }

        let notified = self.publish(cancel, || {
            let fresh: Vec<Intervention> = {
                let mut state = self.state();
                let MonitorState { pending, notified, .. } = &mut *state;
                let mut fresh = Vec::new();
                for intervention in pending.iter_mut() {
                    if notified.insert(intervention.id.clone()) {
                        intervention.notified = true;
                        fresh.push(intervention.clone());
                    }
                }
                fresh
            };
            let count = fresh.len();
            if self.config.notifications_enabled {
                for intervention in fresh {
                    // 监听器可能在本线程内调用了 stop
                    if cancelled() {
                        break;
                    }
                    self.events.emit(&InterventionEvent::NewPending(intervention));
                }
            }
            count
        });
        report.notified = notified.unwrap_or_default();

        Ok(report)
    }

    /// 校验 id 处于 `expected` 列表且没有进行中的决策，返回其快照与标记
    fn begin_decision(&self, id: &str, expected: InterventionStatus) -> Option<(Intervention, DecisionGuard<'_>)> {
        let mut state = self.state();
        if state.deciding.contains(id) {
            return None;
        }
        let list = match expected {
            InterventionStatus::Active => &state.active,
            _ => &state.pending,
        };
        let intervention = list.iter().find(|i| i.id == id)?.clone();
        state.deciding.insert(id.to_string());
        Some((
            intervention,
            DecisionGuard {
                inner: self,
                id: id.to_string(),
            },
        ))
    }

    /// 自动审批传入轮询的 `cancel`：远端已返回但轮询已停止时不改本地状态，返回 Ok(false)
    async fn approve(
        &self,
        id: &str,
        auto: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, InterventionError> {
        let Some((intervention, _guard)) = self.begin_decision(id, InterventionStatus::Pending) else {
            return Ok(false);
        };

        if let Err(error) = self.source.approve(id).await {
            if auto {
                return Err(InterventionError::Decision { id: id.to_string(), action: "approve", source: error });
            }
            return Err(self.decision_failed(id, "approve", error));
        }

        let applied = self.publish(cancel, || {
            let activated = {
                let mut state = self.state();
                state.pending.retain(|i| i.id != id);
                let activated = Intervention {
                    status: InterventionStatus::Active,
                    approved_at: Some(Utc::now()),
                    notified: intervention.notified || auto,
                    ..intervention
                };
                if !state.active.iter().any(|i| i.id == id) {
                    state.active.push(activated.clone());
                }
                if auto {
                    state.auto_approved.insert(id.to_string());
                    state.notified.insert(id.to_string());
                }
                activated
            };
            tracing::info!(intervention_id = id, auto, "Intervention approved");
            self.events.emit(&InterventionEvent::Approved { intervention: activated, auto });
        });
        if applied.is_none() {
            tracing::debug!(intervention_id = id, "Monitor stopped; auto-approval result discarded");
        }
        Ok(applied.is_some())
    }

    fn decision_failed(&self, id: &str, action: &'static str, error: GatewayError) -> InterventionError {
        tracing::error!(intervention_id = id, action, error = %error, "Intervention decision failed");
        self.publish(None, || {
            self.events.emit(&InterventionEvent::DecisionFailed {
                id: id.to_string(),
                action,
                error: error.clone(),
            })
        });
        InterventionError::Decision { id: id.to_string(), action, source: error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interventions::types::InterventionType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Server {
        pending: Vec<Intervention>,
        active: Vec<Intervention>,
    }

    /// 内存中的远端：审批会把条目从 pending 移到 active
    #[derive(Default)]
    struct FakeSource {
        server: Mutex<Server>,
        latency: Option<Duration>,
        decision_latency: Option<Duration>,
        approve_calls: AtomicUsize,
        /// approve 后服务端仍返回为 pending（模拟滞后）
        stale: bool,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fetches: AtomicUsize,
        failing_fetches: AtomicUsize,
        fail_decisions: AtomicBool,
        approvals: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with_pending(pending: Vec<Intervention>) -> Self {
            Self {
                server: Mutex::new(Server { pending, active: Vec::new() }),
                ..Self::default()
            }
        }

        fn approvals(&self) -> Vec<String> {
            self.approvals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InterventionSource for FakeSource {
        async fn fetch_pending(&self) -> Result<Vec<Intervention>, GatewayError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fail = self
                .failing_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(GatewayError::Server { status: 503 });
            }
            Ok(self.server.lock().unwrap().pending.clone())
        }

        async fn fetch_active(&self) -> Result<Vec<Intervention>, GatewayError> {
            Ok(self.server.lock().unwrap().active.clone())
        }

        async fn approve(&self, id: &str) -> Result<(), GatewayError> {
            self.approve_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.decision_latency {
                tokio::time::sleep(latency).await;
            }
            if self.fail_decisions.load(Ordering::SeqCst) {
                return Err(GatewayError::Network("offline".into()));
            }
            self.approvals.lock().unwrap().push(id.to_string());
            if !self.stale {
                let mut server = self.server.lock().unwrap();
                if let Some(pos) = server.pending.iter().position(|i| i.id == id) {
                    let mut item = server.pending.remove(pos);
                    item.status = InterventionStatus::Active;
                    server.active.push(item);
                }
            }
            Ok(())
        }

        async fn reject(&self, id: &str, _reason: &str) -> Result<(), GatewayError> {
            if self.fail_decisions.load(Ordering::SeqCst) {
                return Err(GatewayError::Network("offline".into()));
            }
            self.server.lock().unwrap().pending.retain(|i| i.id != id);
            Ok(())
        }

        async fn dismiss(&self, id: &str) -> Result<(), GatewayError> {
            self.server.lock().unwrap().active.retain(|i| i.id != id);
            Ok(())
        }
    }

    fn item(id: &str, confidence: f64) -> Intervention {
        Intervention::new(id, InterventionType::RecoveryWarning, confidence)
    }

    fn monitor(source: Arc<FakeSource>) -> InterventionMonitor {
        InterventionMonitor::new(MonitorConfig::default(), source)
    }

    fn record(monitor: &InterventionMonitor) -> Arc<Mutex<Vec<InterventionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _ = monitor.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn count(events: &Mutex<Vec<InterventionEvent>>, ty: &str) -> usize {
        events.lock().unwrap().iter().filter(|e| e.event_type() == ty).count()
    }

    fn new_pending_ids(events: &Mutex<Vec<InterventionEvent>>) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                InterventionEvent::NewPending(i) => Some(i.id.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_auto_approval_threshold_is_inclusive_and_once() {
        let source = Arc::new(FakeSource::with_pending(vec![item("hi", 0.95), item("lo", 0.94)]));
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        let report = monitor.check_now().await.unwrap();
        assert_eq!(report.auto_approved, 1);
        assert_eq!(source.approvals(), vec!["hi"]);
        assert_eq!(new_pending_ids(&events), vec!["lo"]);

        let pending = monitor.get_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "lo");
        assert_eq!(pending[0].status, InterventionStatus::Pending);
        let active = monitor.get_active();
        assert_eq!(active[0].id, "hi");
        assert!(active[0].approved_at.is_some());

        // 下一轮：不重复审批，也不重复通知
        let report = monitor.check_now().await.unwrap();
        assert_eq!(report.auto_approved, 0);
        assert_eq!(report.notified, 0);
        assert_eq!(source.approvals(), vec!["hi"]);
        assert_eq!(new_pending_ids(&events), vec!["lo"]);
        assert!(monitor.get_pending()[0].notified);

        let auto: Vec<bool> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                InterventionEvent::Approved { auto, .. } => Some(*auto),
                _ => None,
            })
            .collect();
        assert_eq!(auto, vec![true]);
    }

    #[tokio::test]
    async fn test_stale_server_does_not_cause_second_auto_approval() {
        let source = Arc::new(FakeSource {
            stale: true,
            ..FakeSource::with_pending(vec![item("hi", 0.99)])
        });
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.check_now().await.unwrap();
        monitor.check_now().await.unwrap();
        monitor.check_now().await.unwrap();

        assert_eq!(source.approvals(), vec!["hi"]);
        assert!(new_pending_ids(&events).is_empty());
        assert_eq!(count(&events, "approved"), 1);
    }

    #[tokio::test]
    async fn test_notifications_can_be_disabled() {
        let source = Arc::new(FakeSource::with_pending(vec![item("lo", 0.2)]));
        let config = MonitorConfig { notifications_enabled: false, ..MonitorConfig::default() };
        let monitor = InterventionMonitor::new(config, source);
        let events = record(&monitor);

        let report = monitor.check_now().await.unwrap();
        assert_eq!(report.notified, 1);
        assert!(new_pending_ids(&events).is_empty());
        assert!(monitor.get_pending()[0].notified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_never_overlap() {
        let source = Arc::new(FakeSource {
            latency: Some(Duration::from_secs(5)),
            ..FakeSource::with_pending(vec![item("hi", 0.99), item("lo", 0.1)])
        });
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(30)).await;
        monitor.stop();

        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
        // 每轮 5s 请求 + 1s 间隔
        assert!(source.fetches.load(Ordering::SeqCst) <= 6);
        assert_eq!(source.approvals(), vec!["hi"]);
        assert_eq!(new_pending_ids(&events), vec!["lo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_monitor() {
        let source = Arc::new(FakeSource::with_pending(vec![item("lo", 0.1)]));
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(monitor.is_running());

        assert!(monitor.stop());
        assert!(!monitor.stop());
        assert!(!monitor.is_running());

        let fetches = source.fetches.load(Ordering::SeqCst);
        let emitted = events.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetches);
        assert_eq!(events.lock().unwrap().len(), emitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_tick() {
        let source = Arc::new(FakeSource {
            latency: Some(Duration::from_secs(5)),
            ..FakeSource::with_pending(vec![item("hi", 0.99)])
        });
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.in_flight.load(Ordering::SeqCst), 1);
        monitor.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(events.lock().unwrap().is_empty());
        assert!(source.approvals().is_empty());
        assert!(monitor.get_pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_is_retried_next_interval() {
        let source = Arc::new(FakeSource::with_pending(vec![item("lo", 0.3)]));
        source.failing_fetches.store(1, Ordering::SeqCst);
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.stop();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(new_pending_ids(&events), vec!["lo"]);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_job() {
        let source = Arc::new(FakeSource::default());
        let monitor = monitor(source);
        monitor.start(Duration::from_secs(60));
        monitor.start(Duration::from_secs(60));
        assert!(monitor.stop());
        assert!(!monitor.stop());
    }

    #[tokio::test]
    async fn test_manual_decisions_are_idempotent() {
        let source = Arc::new(FakeSource::with_pending(vec![item("a", 0.5), item("b", 0.5)]));
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);
        monitor.check_now().await.unwrap();

        assert!(monitor.approve("a").await.unwrap());
        assert!(!monitor.approve("a").await.unwrap());
        assert_eq!(source.approvals(), vec!["a"]);

        assert!(monitor.reject("b", "not now").await.unwrap());
        assert!(!monitor.reject("b", "not now").await.unwrap());
        assert!(monitor.get_pending().is_empty());

        assert!(monitor.dismiss("a").await.unwrap());
        assert!(!monitor.dismiss("a").await.unwrap());
        assert!(monitor.get_active().is_empty());

        // 不允许从 active 回到 pending 的路径：对 active 项 reject 无效
        assert!(!monitor.reject("a", "").await.unwrap());

        assert_eq!(count(&events, "approved"), 1);
        assert_eq!(count(&events, "rejected"), 1);
        assert_eq!(count(&events, "dismissed"), 1);
        let rejected = events.lock().unwrap().iter().find_map(|e| match e {
            InterventionEvent::Rejected { intervention, reason } => Some((intervention.status, reason.clone())),
            _ => None,
        });
        assert_eq!(rejected, Some((InterventionStatus::Rejected, "not now".to_string())));
    }

    #[tokio::test]
    async fn test_interactive_failure_surfaces_notification() {
        let source = Arc::new(FakeSource::with_pending(vec![item("a", 0.5)]));
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);
        monitor.check_now().await.unwrap();

        source.fail_decisions.store(true, Ordering::SeqCst);
        let err = monitor.approve("a").await.unwrap_err();
        assert!(matches!(err, InterventionError::Decision { action: "approve", .. }));
        assert_eq!(count(&events, "decision-failed"), 1);
        assert_eq!(monitor.get_pending().len(), 1);

        // 决策标记已释放，可再次尝试
        source.fail_decisions.store(false, Ordering::SeqCst);
        assert!(monitor.approve("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_auto_approval_is_silent_and_retried() {
        let source = Arc::new(FakeSource::with_pending(vec![item("hi", 0.99)]));
        source.fail_decisions.store(true, Ordering::SeqCst);
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        let report = monitor.check_now().await.unwrap();
        assert_eq!(report.auto_approved, 0);
        assert_eq!(count(&events, "decision-failed"), 0);

        source.fail_decisions.store(false, Ordering::SeqCst);
        let report = monitor.check_now().await.unwrap();
        assert_eq!(report.auto_approved, 1);
        assert_eq!(source.approvals(), vec!["hi"]);
    }

    async fn wait_for_approve_call(source: &FakeSource) {
        while source.approve_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_listener_and_silences_rest_of_tick() {
        let source = Arc::new(FakeSource::with_pending(vec![item("hi", 0.99), item("lo", 0.1)]));
        let monitor = monitor(Arc::clone(&source));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _ = monitor.subscribe(move |e| {
            if matches!(e, InterventionEvent::PendingLoaded(_)) {
                std::thread::sleep(Duration::from_millis(200));
            }
            sink.lock().unwrap().push(e.event_type());
        });

        monitor.start(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.stop());
        let at_stop = events.lock().unwrap().clone();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(at_stop, vec!["pending-loaded", "active-loaded"]);
        assert_eq!(*events.lock().unwrap(), at_stop);
        assert!(source.approvals().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_auto_approval_leaves_state_untouched() {
        let source = Arc::new(FakeSource {
            decision_latency: Some(Duration::from_millis(200)),
            ..FakeSource::with_pending(vec![item("hi", 0.99)])
        });
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        monitor.start(Duration::from_secs(60));
        wait_for_approve_call(&source).await;
        assert!(monitor.stop());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(count(&events, "approved"), 0);
        assert_eq!(count(&events, "new-pending"), 0);
        assert!(monitor.get_active().is_empty());
        assert_eq!(monitor.get_pending()[0].id, "hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_tick_discards_completed_auto_approval() {
        let source = Arc::new(FakeSource {
            decision_latency: Some(Duration::from_millis(200)),
            ..FakeSource::with_pending(vec![item("hi", 0.99)])
        });
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&monitor.inner);
        let token = cancel.clone();
        let tick = tokio::spawn(async move { inner.tick(Some(&token)).await });
        wait_for_approve_call(&source).await;
        cancel.cancel();

        // 远端审批照常完成，但本地状态与事件都不再变化
        let report = tick.await.unwrap().unwrap();
        assert_eq!(report.auto_approved, 0);
        assert_eq!(source.approvals(), vec!["hi"]);
        assert_eq!(count(&events, "approved"), 0);
        assert_eq!(count(&events, "new-pending"), 0);
        assert!(monitor.get_active().is_empty());
        assert!(monitor.inner.state().auto_approved.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_can_stop_monitor() {
        let source = Arc::new(FakeSource::with_pending(vec![item("hi", 0.99), item("lo", 0.1)]));
        let monitor = monitor(Arc::clone(&source));
        let events = record(&monitor);
        let handle = monitor.clone();
        let _ = monitor.subscribe(move |e| {
            if matches!(e, InterventionEvent::PendingLoaded(_)) {
                handle.stop();
            }
        });

        monitor.start(Duration::from_secs(60));
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not stop the monitor");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(source.approvals().is_empty());
        assert_eq!(count(&events, "new-pending"), 0);
        assert_eq!(count(&events, "pending-loaded"), 1);
    }
}
