//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PHOENIX__*` 覆盖（双下划线表示嵌套，如 `PHOENIX__BUTLER__MAX_CONCURRENT=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub butler: ButlerSection,
    #[serde(default)]
    pub interventions: InterventionsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [api] 段：后端地址与单次请求超时
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单次传输调用超时（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// [gateway] 段：重试与限流
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// 单次逻辑请求最多重试次数（5xx 退避与 401 刷新共用）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次退避（毫秒），之后每次翻倍
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 429 未给出 Retry-After 时的等待秒数
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_retry_after_secs() -> u64 {
    5
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// 调用未指定 TTL 时的默认有效期（毫秒）
    #[serde(default = "default_cache_ttl_ms")]
    pub default_ttl_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

/// [butler] 段：自动动作并发上限与单任务超时
#[derive(Debug, Clone, Deserialize)]
pub struct ButlerSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for ButlerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

/// [interventions] 段：轮询间隔与自动审批阈值
#[derive(Debug, Clone, Deserialize)]
pub struct InterventionsSection {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// confidence ≥ 阈值时自动审批
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
    #[serde(default = "default_notifications_enabled")]
    pub notifications_enabled: bool,
}

impl Default for InterventionsSection {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            auto_approve_threshold: default_auto_approve_threshold(),
            notifications_enabled: default_notifications_enabled(),
        }
    }
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_auto_approve_threshold() -> f64 {
    0.95
}

fn default_notifications_enabled() -> bool {
    true
}

/// [session] 段：凭据文件路径，未设置时只保存在内存
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 PHOENIX__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PHOENIX__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PHOENIX")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
