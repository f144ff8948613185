//! Butler 动作队列（有界并发执行器）
//!
//! 核心功能：
//! - FIFO 排队，同时处理中的任务不超过 `max_concurrent`
//! - 入队后与每个任务结束后触发 `drain`，不等待单个任务完成
//! - 任务失败只记录在该任务上，不阻塞队列
//! - 每个任务带超时与取消，超时或关闭时释放并发槽位
//!
//! 任务结束后立即从活动表移除，结果通过事件交付。

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::action::{ActionKind, TaskType};
use crate::api::{ApiResponse, RequestGateway};
use crate::config::AppConfig;
use crate::core::{EventBus, GatewayError, Subscription, TaskError};

/// 任务 ID
pub type TaskId = String;

/// 任务状态：queued → processing → completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Butler 任务
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub params: Value,
    pub status: TaskStatus,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(task_type: TaskType, params: Value) -> Self {
        Self {
            id: format!("action_{}", uuid::Uuid::new_v4()),
            task_type,
            params,
            status: TaskStatus::Queued,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 队列事件
#[derive(Debug, Clone)]
pub enum ButlerEvent {
    Queued(Task),
    Started(Task),
    Completed(Task),
    Failed { task: Task, error: TaskError },
}

impl ButlerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ButlerEvent::Queued(_) => "action-queued",
            ButlerEvent::Started(_) => "action-started",
            ButlerEvent::Completed(_) => "action-completed",
            ButlerEvent::Failed { .. } => "action-failed",
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            ButlerEvent::Queued(t) | ButlerEvent::Started(t) | ButlerEvent::Completed(t) => t,
            ButlerEvent::Failed { task, .. } => task,
        }
    }
}

/// 动作执行接口；`cancel` 触发时实现应尽快放弃底层调用
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        kind: ActionKind,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError>;
}

/// 通过 RequestGateway 执行动作
pub struct GatewayActionExecutor {
    gateway: Arc<RequestGateway>,
}

impl GatewayActionExecutor {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ActionExecutor for GatewayActionExecutor {
    async fn execute(
        &self,
        kind: ActionKind,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        let call = kind.to_call(params);
        match self.gateway.execute_with_cancel(&call, cancel).await? {
            ApiResponse::Data(data) => Ok(data),
            ApiResponse::NotFound => {
                tracing::debug!(action = %kind, path = %call.path, "Butler endpoint returned not found");
                Ok(Value::Null)
            }
        }
    }
}

/// 队列参数
#[derive(Debug, Clone)]
pub struct ButlerConfig {
    pub max_concurrent: usize,
    pub task_timeout: Duration,
}

impl Default for ButlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            task_timeout: Duration::from_millis(30_000),
        }
    }
}

impl From<&AppConfig> for ButlerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.butler.max_concurrent,
            task_timeout: Duration::from_millis(config.butler.task_timeout_ms),
        }
    }
}

/// 队列计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Task>,
    processing: HashMap<TaskId, Task>,
    completed: u64,
    failed: u64,
}

struct Inner {
    max_concurrent: usize,
    task_timeout: Duration,
    executor: Arc<dyn ActionExecutor>,
    state: Mutex<QueueState>,
    events: EventBus<ButlerEvent>,
    shutdown: CancellationToken,
}

/// Butler 动作队列；克隆共享同一队列
#[derive(Clone)]
pub struct ButlerQueue {
    inner: Arc<Inner>,
}

impl ButlerQueue {
    pub fn new(config: ButlerConfig, executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: config.max_concurrent.max(1),
                task_timeout: config.task_timeout,
                executor,
                state: Mutex::new(QueueState::default()),
                events: EventBus::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ButlerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// 提交已知动作；不阻塞，需在 tokio 运行时内调用
    pub fn enqueue(&self, kind: ActionKind, params: Value) -> TaskId {
        self.submit(TaskType::Known(kind), params)
    }

    /// 按名称提交；无法识别的名称照常入队，执行时以 `UnknownTaskType` 失败
    pub fn enqueue_named(&self, name: &str, params: Value) -> TaskId {
        self.submit(TaskType::from_name(name), params)
    }

    fn submit(&self, task_type: TaskType, params: Value) -> TaskId {
        let task = Task::new(task_type, params);
        let id = task.id.clone();

        // 先发 Queued 再入队：入队前任务对 drain 不可见，Started 不会抢在 Queued 之前
        tracing::info!(task_id = %id, action = %task.task_type, "Butler action queued");
        self.inner.events.emit(&ButlerEvent::Queued(task.clone()));
        self.inner.state().queued.push_back(task);

        Inner::drain(&self.inner);
        id
    }

    /// 排队中或处理中的任务；已结束的任务不保留
    pub fn get(&self, task_id: &str) -> Option<Task> {
        let state = self.inner.state();
        state
            .processing
            .get(task_id)
            .cloned()
            .or_else(|| state.queued.iter().find(|t| t.id == task_id).cloned())
    }

    pub fn queued(&self) -> Vec<Task> {
        self.inner.state().queued.iter().cloned().collect()
    }

    pub fn processing(&self) -> Vec<Task> {
        self.inner.state().processing.values().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            queued: state.queued.len(),
            processing: state.processing.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// 取消所有处理中的任务；之后出队的任务立即以 `Cancelled` 失败
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(stats = ?self.stats(), "Butler queue shutting down");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 在并发上限内按 FIFO 派发排队任务，不等待其完成
    fn drain(inner: &Arc<Inner>) {
        let started = {
            let mut state = inner.state();
            let mut started = Vec::new();
            while state.processing.len() < inner.max_concurrent {
                let Some(mut task) = state.queued.pop_front() else {
                    break;
                };
                task.status = TaskStatus::Processing;
                task.started_at = Some(chrono::Utc::now().timestamp_millis());
                state.processing.insert(task.id.clone(), task.clone());
                started.push(task);
            }
            started
        };

        for task in started {
            tracing::debug!(task_id = %task.id, action = %task.task_type, "Butler action started");
            inner.events.emit(&ButlerEvent::Started(task.clone()));
            tokio::spawn(Inner::run(Arc::clone(inner), task));
        }
    }

    async fn run(inner: Arc<Inner>, task: Task) {
        let outcome = match &task.task_type {
            TaskType::Unrecognized(name) => Err(TaskError::UnknownTaskType(name.clone())),
            TaskType::Known(kind) => inner.dispatch(*kind, &task.params).await,
        };

        inner.finish(&task.id, outcome);
        Inner::drain(&inner);
    }

    async fn dispatch(&self, kind: ActionKind, params: &Value) -> Result<Value, TaskError> {
        let cancel = self.shutdown.child_token();
        let work = AssertUnwindSafe(self.executor.execute(kind, params, &cancel)).catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            result = tokio::time::timeout(self.task_timeout, work) => match result {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(GatewayError::Cancelled))) => Err(TaskError::Cancelled),
                Ok(Ok(Err(e))) => Err(TaskError::Execution(e)),
                Ok(Err(_)) => Err(TaskError::Panicked),
                Err(_) => Err(TaskError::Timeout(self.task_timeout)),
            },
        }
    }

    fn finish(&self, task_id: &str, outcome: Result<Value, TaskError>) {
        let now = chrono::Utc::now().timestamp_millis();
        let event = {
            let mut state = self.state();
            let Some(mut task) = state.processing.remove(task_id) else {
                return;
            };
            match outcome {
                Ok(result) => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now);
                    task.result = Some(result);
                    state.completed += 1;
                    ButlerEvent::Completed(task)
                }
                Err(error) => {
                    task.status = TaskStatus::Failed;
                    task.failed_at = Some(now);
                    task.error = Some(error.to_string());
                    state.failed += 1;
                    ButlerEvent::Failed { task, error }
                }
            }
        };

        match &event {
            ButlerEvent::Failed { task, error } => {
                tracing::warn!(task_id = %task.id, action = %task.task_type, %error, "Butler action failed")
            }
            other => {
                let task = other.task();
                tracing::info!(task_id = %task.id, action = %task.task_type, "Butler action completed")
            }
        }
        self.events.emit(&event);
    }
}
