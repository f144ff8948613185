//! 登录凭据的持久化存储
//!
//! token、refresh token 与用户 ID 跨进程重启保留；缓存与队列状态只在内存中。

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::GatewayError;

/// 已保存的登录凭据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.refresh_token.is_none() && self.user_id.is_none()
    }
}

/// 凭据存储接口
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Credentials, GatewayError>;

    async fn save(&self, credentials: &Credentials) -> Result<(), GatewayError>;

    async fn clear(&self) -> Result<(), GatewayError>;
}

/// 内存存储（测试 / 无持久化场景）
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Credentials, GatewayError> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), GatewayError> {
        *self.inner.write().await = credentials.clone();
        Ok(())
    }

    async fn clear(&self) -> Result<(), GatewayError> {
        *self.inner.write().await = Credentials::default();
        Ok(())
    }
}

/// JSON 文件存储
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Credentials, GatewayError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Storage(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Credentials::default()),
            Err(e) => Err(GatewayError::Storage(format!("{}: {}", self.path.display(), e))),
        }
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), GatewayError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(credentials)
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| GatewayError::Storage(format!("{}: {}", self.path.display(), e)))
    }

    async fn clear(&self) -> Result<(), GatewayError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Storage(format!("{}: {}", self.path.display(), e))),
        }
    }
}
