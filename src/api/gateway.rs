//! RequestGateway：所有出站调用的唯一入口
//!
//! 负责：
//! - 缓存读穿（仅 GET 且显式标记可缓存）
//! - 401/403：刷新一次 token 后以 `retry = false` 重放一次
//! - 429：按服务端提示（或默认值）等待后无条件重放，不计入重试预算
//! - 5xx：指数退避重试，至多 `max_retries` 次
//! - 404：不是错误，返回 `ApiResponse::NotFound`
//! - 传输 / 解析失败：`GatewayError::Network`，不自动重试
//!
//! 重试计数按单次逻辑请求计算，并发请求之间互不影响。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cache::CacheStore;
use super::request::{CallDescriptor, Method};
use super::session::{CredentialStore, Credentials};
use super::transport::{Transport, TransportRequest, TransportResponse};
use crate::config::AppConfig;
use crate::core::{EventBus, GatewayError, Subscription};

/// 网关运行参数
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 形如 `https://host/api`，与 path 直接拼接
    pub base_url: String,
    pub max_retries: u32,
    /// 第一次 5xx 重试前的等待，之后每次翻倍
    pub base_delay: Duration,
    /// 429 未携带 Retry-After 时的等待
    pub default_retry_after: Duration,
    pub default_cache_ttl: Duration,
    /// 单次传输调用的超时
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            default_retry_after: Duration::from_secs(5),
            default_cache_ttl: Duration::from_millis(300_000),
            request_timeout: Duration::from_millis(30_000),
        }
    }
}

impl From<&AppConfig> for GatewayConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_url: config.api.base_url.clone(),
            max_retries: config.gateway.max_retries,
            base_delay: Duration::from_millis(config.gateway.base_delay_ms),
            default_retry_after: Duration::from_secs(config.gateway.default_retry_after_secs),
            default_cache_ttl: Duration::from_millis(config.cache.default_ttl_ms),
            request_timeout: Duration::from_millis(config.api.request_timeout_ms),
        }
    }
}

/// 成功结果：带数据，或显式的“不存在”标记
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Data(Value),
    NotFound,
}

impl ApiResponse {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiResponse::NotFound)
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ApiResponse::Data(v) => Some(v),
            ApiResponse::NotFound => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            ApiResponse::Data(v) => Some(v),
            ApiResponse::NotFound => None,
        }
    }
}

/// 网关事件（供连接状态展示）
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    CacheHit { path: String },
    Retrying { method: Method, path: String, attempt: u32, delay: Duration, status: u16 },
    RateLimited { path: String, wait: Duration },
    TokenRefreshed,
    SessionExpired,
}

pub struct RequestGateway {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    session: RwLock<Credentials>,
    cache: CacheStore,
    /// 并发 401 时只有一个请求真正去刷新
    refresh_lock: Mutex<()>,
    events: EventBus<GatewayEvent>,
}

impl RequestGateway {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            session: RwLock::new(Credentials::default()),
            cache: CacheStore::new(),
            refresh_lock: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// 从持久化存储恢复凭据，返回是否存在 token
    pub async fn restore_session(&self) -> Result<bool, GatewayError> {
        let credentials = self.store.load().await?;
        let has_token = credentials.token.is_some();
        *self.session.write().await = credentials;
        if has_token {
            tracing::info!("Restored saved session");
        }
        Ok(has_token)
    }

    pub async fn credentials(&self) -> Credentials {
        self.session.read().await.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.session.read().await.user_id.clone()
    }

    pub async fn set_credentials(&self, credentials: Credentials) -> Result<(), GatewayError> {
        self.store.save(&credentials).await?;
        *self.session.write().await = credentials;
        Ok(())
    }

    /// 登录并保存 token / refresh token / 用户 ID
    pub async fn login(&self, email: &str, password: &str) -> Result<Credentials, GatewayError> {
        let call = CallDescriptor::post("/auth/login", json!({ "email": email, "password": password }))
            .skip_auth()
            .no_retry();
        let data = match self.execute(&call).await {
            Ok(ApiResponse::Data(data)) => data,
            Ok(ApiResponse::NotFound) | Err(GatewayError::Http { .. }) => {
                return Err(GatewayError::Authentication)
            }
            Err(e) => return Err(e),
        };

        let token = data.get("token").and_then(Value::as_str).ok_or(GatewayError::Authentication)?;
        let user = data.get("user");
        let user_id = user
            .and_then(|u| u.get("id").or_else(|| u.get("_id")))
            .or_else(|| data.get("userId"))
            .and_then(Value::as_str);

        let credentials = Credentials {
            token: Some(token.to_string()),
            refresh_token: data.get("refreshToken").and_then(Value::as_str).map(String::from),
            user_id: user_id.map(String::from),
        };
        self.set_credentials(credentials.clone()).await?;
        tracing::info!(user_id = ?credentials.user_id, "Login successful");
        Ok(credentials)
    }

    /// 清除凭据与缓存
    pub async fn logout(&self) -> Result<(), GatewayError> {
        *self.session.write().await = Credentials::default();
        self.cache.clear().await;
        self.store.clear().await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, GatewayError> {
        self.execute(&CallDescriptor::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, GatewayError> {
        self.execute(&CallDescriptor::post(path, body)).await
    }

    pub async fn execute(&self, call: &CallDescriptor) -> Result<ApiResponse, GatewayError> {
        self.run(call).await
    }

    /// 整个逻辑请求（含退避等待）与 `cancel` 竞争；取消时丢弃进行中的传输 future
    pub async fn execute_with_cancel(
        &self,
        call: &CallDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, GatewayError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(method = %call.method, path = %call.path, "Request cancelled");
                Err(GatewayError::Cancelled)
            }
            result = self.run(call) => result,
        }
    }

    async fn run(&self, call: &CallDescriptor) -> Result<ApiResponse, GatewayError> {
        if call.path.is_empty() {
            return Err(GatewayError::InvalidRequest("path must not be empty".to_string()));
        }

        if call.is_cacheable() {
            if let Some(data) = self.cache.get(call.cache_key(), Instant::now()).await {
                tracing::debug!(path = %call.path, "Cache hit");
                self.events.emit(&GatewayEvent::CacheHit { path: call.path.clone() });
                return Ok(ApiResponse::Data(data));
            }
        }

        let mut retry = call.options.retry;
        let mut retries_used: u32 = 0;
        let mut refreshed = false;

        loop {
            let bearer = if call.options.skip_auth {
                None
            } else {
                self.session.read().await.token.clone()
            };
            let response = self.send_once(call, bearer.clone()).await?;

            match response.status {
                200..=299 => {
                    let data = parse_body(&response.body)?;
                    if call.is_cacheable() {
                        let ttl = call.options.cache_ttl.unwrap_or(self.config.default_cache_ttl);
                        self.cache.insert(call.cache_key(), data.clone(), ttl, Instant::now()).await;
                    }
                    return Ok(ApiResponse::Data(data));
                }
                401 | 403 => {
                    let can_refresh = retry
                        && !refreshed
                        && !call.options.skip_auth
                        && retries_used < self.config.max_retries;
                    if !can_refresh {
                        tracing::warn!(method = %call.method, path = %call.path, status = response.status, "Authentication failed");
                        return Err(GatewayError::Authentication);
                    }
                    retries_used += 1;
                    refreshed = true;
                    retry = false;
                    self.refresh_session(bearer.as_deref()).await?;
                }
                429 => {
                    let wait = response.retry_after.unwrap_or(self.config.default_retry_after);
                    tracing::warn!(path = %call.path, ?wait, "Rate limited, waiting before replay");
                    self.events.emit(&GatewayEvent::RateLimited { path: call.path.clone(), wait });
                    tokio::time::sleep(wait).await;
                }
                404 => {
                    tracing::debug!(path = %call.path, "Resource not found");
                    return Ok(ApiResponse::NotFound);
                }
                status if status >= 500 => {
                    if !retry || retries_used >= self.config.max_retries {
                        tracing::error!(method = %call.method, path = %call.path, status, retries_used, "Server error, giving up");
                        return Err(GatewayError::Server { status });
                    }
                    retries_used += 1;
                    let delay = self.backoff(retries_used);
                    tracing::warn!(method = %call.method, path = %call.path, status, attempt = retries_used, ?delay, "Server error, retrying");
                    self.events.emit(&GatewayEvent::Retrying {
                        method: call.method,
                        path: call.path.clone(),
                        attempt: retries_used,
                        delay,
                        status,
                    });
                    tokio::time::sleep(delay).await;
                }
                status => {
                    return Err(GatewayError::Http {
                        status,
                        message: error_message(&response),
                    });
                }
            }
        }
    }

    /// 第 n 次重试前的等待：base * 2^(n-1)
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config.base_delay.saturating_mul(factor)
    }

    async fn send_once(
        &self,
        call: &CallDescriptor,
        bearer: Option<String>,
    ) -> Result<TransportResponse, GatewayError> {
        let body = match call.method {
            Method::Get => None,
            _ => call.body.clone(),
        };
        self.send(TransportRequest {
            method: call.method,
            url: self.url(&call.path),
            bearer,
            body,
        })
        .await
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, GatewayError> {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Transport failure");
                Err(GatewayError::Network(e))
            }
            Err(_) => Err(GatewayError::Timeout(timeout)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// 刷新 token；`stale_token` 是触发 401 的那次请求所用的 token
    ///
    /// 直接走传输层，不经过 `run`，因此不会递归。失败时清除会话。
    async fn refresh_session(&self, stale_token: Option<&str>) -> Result<(), GatewayError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.session.read().await.clone();
        if current.token.is_some() && current.token.as_deref() != stale_token {
            // 等锁期间已有其他请求刷新成功
            return Ok(());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            tracing::warn!("No refresh token available");
            self.expire_session().await;
            return Err(GatewayError::Authentication);
        };

        let response = self
            .send(TransportRequest {
                method: Method::Post,
                url: self.url("/auth/refresh"),
                bearer: None,
                body: Some(json!({ "refreshToken": refresh_token })),
            })
            .await;

        let data = match response {
            Ok(r) if r.is_success() => serde_json::from_str::<Value>(&r.body).unwrap_or(Value::Null),
            Ok(r) => {
                tracing::warn!(status = r.status, "Token refresh rejected");
                Value::Null
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                Value::Null
            }
        };

        let Some(token) = data.get("token").and_then(Value::as_str) else {
            self.expire_session().await;
            return Err(GatewayError::Authentication);
        };

        let mut credentials = current;
        credentials.token = Some(token.to_string());
        if let Some(next) = data.get("refreshToken").and_then(Value::as_str) {
            credentials.refresh_token = Some(next.to_string());
        }
        if let Err(e) = self.store.save(&credentials).await {
            tracing::warn!(error = %e, "Failed to persist refreshed token");
        }
        *self.session.write().await = credentials;

        tracing::info!("Access token refreshed");
        self.events.emit(&GatewayEvent::TokenRefreshed);
        Ok(())
    }

    /// 清空会话；已是空会话时（另一请求刚让它过期）不重复通知
    async fn expire_session(&self) {
        let previous = std::mem::take(&mut *self.session.write().await);
        if previous.is_empty() {
            return;
        }
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear stored credentials");
        }
        self.events.emit(&GatewayEvent::SessionExpired);
    }
}

fn parse_body(body: &str) -> Result<Value, GatewayError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|e| GatewayError::Network(format!("invalid JSON response: {}", e)))
}

fn error_message(response: &TransportResponse) -> String {
    serde_json::from_str::<Value>(&response.body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| response.body.chars().take(200).collect())
}
