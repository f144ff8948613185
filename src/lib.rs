//! Phoenix - 客户端编排层
//!
//! 模块划分：
//! - **api**: 出站请求网关（缓存、重试、token 刷新、限流处理）与凭据存储
//! - **butler**: 后台动作队列（有界并发、超时、取消）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、事件总线、上下文构建、优雅关闭
//! - **interventions**: 干预轮询、自动审批与人工决策
//! - **observability**: 日志初始化

pub mod api;
pub mod butler;
pub mod config;
pub mod core;
pub mod interventions;
pub mod observability;

pub use crate::core::{ContextBuilder, PhoenixContext};
