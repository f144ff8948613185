//! 核心层：错误分类、事件总线、上下文构建、优雅关闭

pub mod context;
pub mod error;
pub mod events;
pub mod shutdown;

pub use context::{ContextBuilder, PhoenixContext};
pub use error::{GatewayError, InterventionError, TaskError};
pub use events::{EventBus, Subscription};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
