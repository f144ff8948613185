//! 错误分类
//!
//! 网关层（GatewayError）、Butler 任务层（TaskError）与干预决策层（InterventionError）。
//! 全部实现 Clone，便于存入任务记录并随事件广播。

use std::time::Duration;

use thiserror::Error;

/// RequestGateway 对调用方暴露的错误
///
/// 429 与预算内的 `Server` 由网关内部等待或重试消化（429 只以 `GatewayEvent::RateLimited` 出现），
/// `Server` 只有预算耗尽后才会冒泡。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Credential storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// 是否属于可由下一轮自愈的瞬时错误（后台轮询据此只记日志）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Server { .. } | GatewayError::Network(_) | GatewayError::Timeout(_)
        )
    }
}

/// Butler 任务失败原因；只记录在任务自身，不影响队列
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Task execution failed: {0}")]
    Execution(#[from] GatewayError),

    #[error("Task handler panicked")]
    Panicked,

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task cancelled")]
    Cancelled,
}

/// 干预审批 / 拒绝 / 忽略失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterventionError {
    #[error("Intervention {id} {action} failed: {source}")]
    Decision {
        id: String,
        action: &'static str,
        #[source]
        source: GatewayError,
    },
}
