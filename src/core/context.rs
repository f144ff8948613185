//! 上下文构建器：统一组装网关、Butler 队列与干预监控
//!
//! 每个 `PhoenixContext` 拥有独立的会话、缓存与队列，测试中可并存多个实例。

use std::sync::Arc;

use crate::api::{
    CredentialStore, FileCredentialStore, GatewayConfig, MemoryCredentialStore, ReqwestTransport,
    RequestGateway, Transport,
};
use crate::butler::{ActionExecutor, ButlerConfig, ButlerQueue, GatewayActionExecutor};
use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::interventions::{GatewayInterventionSource, InterventionMonitor, InterventionSource, MonitorConfig};

/// 组装完成的运行时组件
#[derive(Clone)]
pub struct PhoenixContext {
    pub gateway: Arc<RequestGateway>,
    pub butler: ButlerQueue,
    pub interventions: InterventionMonitor,
}

impl PhoenixContext {
    /// 停止轮询并取消 Butler 中的任务
    pub fn shutdown(&self) {
        self.interventions.stop();
        self.butler.shutdown();
    }
}

/// 构建器：未显式注入的部件按配置创建
pub struct ContextBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn CredentialStore>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    source: Option<Arc<dyn InterventionSource>>,
}

impl ContextBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            executor: None,
            source: None,
        }
    }

    /// 注入传输层（默认 reqwest）
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 注入凭据存储（默认按 `session.path` 选择文件或内存）
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_intervention_source(mut self, source: Arc<dyn InterventionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<PhoenixContext, GatewayError> {
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new().map_err(GatewayError::Network)?),
        };
        let store: Arc<dyn CredentialStore> = match (self.store, &self.config.session.path) {
            (Some(s), _) => s,
            (None, Some(path)) => Arc::new(FileCredentialStore::new(path.clone())),
            (None, None) => Arc::new(MemoryCredentialStore::new()),
        };

        let gateway = Arc::new(RequestGateway::new(
            GatewayConfig::from(&self.config),
            transport,
            store,
        ));

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(GatewayActionExecutor::new(Arc::clone(&gateway))));
        let butler = ButlerQueue::new(ButlerConfig::from(&self.config), executor);

        let source = self
            .source
            .unwrap_or_else(|| Arc::new(GatewayInterventionSource::new(Arc::clone(&gateway))));
        let interventions = InterventionMonitor::new(MonitorConfig::from(&self.config), source);

        tracing::info!(
            base_url = %gateway.config().base_url,
            max_concurrent = butler.max_concurrent(),
            "Phoenix context built"
        );

        Ok(PhoenixContext {
            gateway,
            butler,
            interventions,
        })
    }
}
