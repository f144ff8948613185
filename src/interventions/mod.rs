//! 干预：系统生成的建议，轮询、自动审批与人工决策

pub mod monitor;
pub mod source;
pub mod types;

pub use monitor::{InterventionEvent, InterventionMonitor, MonitorConfig, TickReport};
pub use source::{GatewayInterventionSource, InterventionSource};
pub use types::{Intervention, InterventionStatus, InterventionType};
