//! 请求结果缓存（TTL 键控，读时惰性失效）
//!
//! 页面生命周期内的缓存：不做主动淘汰，同键后写覆盖先写。
//! 调用方每次请求只读一次时钟并把 `now` 传进来，避免刚写入就相对自身过期。

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Value,
    pub expires_at: Instant,
}

impl CacheEntry {
    /// `now > expires_at` 才算过期
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// TTL 缓存
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未过期则返回数据；过期条目在此处删除
    pub async fn get(&self, key: &str, now: Instant) -> Option<Value> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.data.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        // 读写锁切换之间可能已被新值覆盖
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            tracing::debug!(key, "Cache entry expired");
        }
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.data.clone())
    }

    pub async fn insert(&self, key: impl Into<String>, data: Value, ttl: Duration, now: Instant) {
        self.entries.write().await.insert(
            key.into(),
            CacheEntry {
                data,
                expires_at: now + ttl,
            },
        );
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// 当前条目数（含尚未被读到的过期条目）
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
