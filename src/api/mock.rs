//! 脚本化传输（用于测试与离线运行，无需后端）
//!
//! 两种应答来源：按 method + path 注册的固定路由（可多次命中），
//! 以及按顺序消费的脚本队列。每个收到的请求连同时间戳都会被记录，
//! 应答前被丢弃（超时或取消）的请求单独计数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::request::Method;
use super::transport::{Transport, TransportRequest, TransportResponse};

type Responder = Arc<dyn Fn(&TransportRequest) -> Result<TransportResponse, String> + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    responder: Responder,
}

/// 已记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub request: TransportRequest,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, String>>>,
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
    latency: Mutex<Option<Duration>>,
    aborted: AtomicUsize,
}

/// 在途标记：`send` 的 future 在应答前被 drop 时计为一次中止
struct InFlight<'a> {
    aborted: &'a AtomicUsize,
    answered: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个按顺序消费的响应
    pub fn push(&self, response: TransportResponse) -> &Self {
        lock(&self.script).push_back(Ok(response));
        self
    }

    pub fn push_json(&self, status: u16, body: Value) -> &Self {
        self.push(TransportResponse::json(status, &body))
    }

    /// 追加一次传输失败
    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        lock(&self.script).push_back(Err(message.into()));
        self
    }

    /// 注册固定路由；`path` 匹配 URL 后缀
    pub fn route<F>(&self, method: Method, path: impl Into<String>, responder: F) -> &Self
    where
        F: Fn(&TransportRequest) -> Result<TransportResponse, String> + Send + Sync + 'static,
    {
        lock(&self.routes).push(Route {
            method,
            path: path.into(),
            responder: Arc::new(responder),
        });
        self
    }

    pub fn route_json(&self, method: Method, path: impl Into<String>, status: u16, body: Value) -> &Self {
        let response = TransportResponse::json(status, &body);
        self.route(method, path, move |_| Ok(response.clone()))
    }

    /// 每个请求在应答前等待的时长
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// URL 以 `path` 结尾的请求数
    pub fn count_for(&self, method: Method, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.request.method == method && r.request.url.ends_with(path))
            .count()
    }

    /// 应答前被丢弃的请求数
    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &TransportRequest) -> Result<TransportResponse, String> {
        let responder = lock(&self.routes)
            .iter()
            .find(|r| r.method == request.method && request.url.ends_with(&r.path))
            .map(|r| Arc::clone(&r.responder));
        if let Some(responder) = responder {
            return responder(request);
        }

        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(format!("no scripted response for {} {}", request.method, request.url)))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, String> {
        lock(&self.requests).push(RecordedRequest {
            at: Instant::now(),
            request: request.clone(),
        });

        let mut in_flight = InFlight {
            aborted: &self.aborted,
            answered: false,
        };
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        in_flight.answered = true;
        self.respond(&request)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
