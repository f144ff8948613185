//! Butler：后台动作的有界并发执行

pub mod action;
pub mod queue;

pub use action::{ActionKind, TaskType};
pub use queue::{
    ActionExecutor, ButlerConfig, ButlerEvent, ButlerQueue, GatewayActionExecutor, QueueStats, Task, TaskId,
    TaskStatus,
};
