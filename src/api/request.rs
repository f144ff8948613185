//! 调用描述：一次逻辑请求的 path / method / body / options，单次调用内不可变

use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// 支持的 HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用选项
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    /// 不附带 Bearer token（登录、刷新等）
    pub skip_auth: bool,
    /// 读穿缓存；仅对 GET 生效
    pub cache: bool,
    /// 缓存有效期；None 时使用配置的默认值
    pub cache_ttl: Option<Duration>,
    /// 是否允许 401/403 刷新重放与 5xx 退避重试
    pub retry: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            skip_auth: false,
            cache: false,
            cache_ttl: None,
            retry: true,
        }
    }
}

/// 一次逻辑请求
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    pub options: CallOptions,
}

impl CallDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            body: None,
            options: CallOptions::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// 标记为可缓存，`ttl` 为 None 时用默认有效期
    pub fn cached(mut self, ttl: Option<Duration>) -> Self {
        self.options.cache = true;
        self.options.cache_ttl = ttl;
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.options.skip_auth = true;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.options.retry = false;
        self
    }

    /// 缓存只对 GET 生效
    pub fn is_cacheable(&self) -> bool {
        self.options.cache && self.method == Method::Get
    }

    /// 缓存键：path（含查询串）
    pub fn cache_key(&self) -> &str {
        &self.path
    }
}
