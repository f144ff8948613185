//! 干预数据源：远端为唯一可信来源，监控器通过此接口拉取与提交决策

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::Intervention;
use crate::api::{ApiResponse, CallDescriptor, RequestGateway};
use crate::core::GatewayError;

#[async_trait]
pub trait InterventionSource: Send + Sync {
    async fn fetch_pending(&self) -> Result<Vec<Intervention>, GatewayError>;

    async fn fetch_active(&self) -> Result<Vec<Intervention>, GatewayError>;

    async fn approve(&self, id: &str) -> Result<(), GatewayError>;

    async fn reject(&self, id: &str, reason: &str) -> Result<(), GatewayError>;

    async fn dismiss(&self, id: &str) -> Result<(), GatewayError>;
}

/// 基于 RequestGateway 的实现
///
/// 轮询读取不走缓存，否则每次 tick 都可能拿到旧数据。
pub struct GatewayInterventionSource {
    gateway: Arc<RequestGateway>,
}

impl GatewayInterventionSource {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<Intervention>, GatewayError> {
        match self.gateway.execute(&CallDescriptor::get(path)).await? {
            ApiResponse::NotFound => Ok(Vec::new()),
            ApiResponse::Data(data) => parse_list(data),
        }
    }

    async fn decide(&self, path: String, body: Value) -> Result<(), GatewayError> {
        self.gateway.execute(&CallDescriptor::post(path, body)).await.map(|_| ())
    }
}

#[async_trait]
impl InterventionSource for GatewayInterventionSource {
    async fn fetch_pending(&self) -> Result<Vec<Intervention>, GatewayError> {
        self.fetch("/phoenix/interventions/pending").await
    }

    async fn fetch_active(&self) -> Result<Vec<Intervention>, GatewayError> {
        self.fetch("/phoenix/interventions/active").await
    }

    async fn approve(&self, id: &str) -> Result<(), GatewayError> {
        self.decide(format!("/phoenix/interventions/{}/approve", id), json!({})).await
    }

    async fn reject(&self, id: &str, reason: &str) -> Result<(), GatewayError> {
        self.decide(format!("/phoenix/interventions/{}/reject", id), json!({ "reason": reason }))
            .await
    }

    async fn dismiss(&self, id: &str) -> Result<(), GatewayError> {
        self.decide(format!("/phoenix/interventions/{}/dismiss", id), json!({})).await
    }
}

/// 接受 `{"interventions": [...]}` 或裸数组；缺字段视为空列表
fn parse_list(data: Value) -> Result<Vec<Intervention>, GatewayError> {
    let list = match data {
        Value::Array(_) => data,
        Value::Object(mut map) => map.remove("interventions").unwrap_or(Value::Array(Vec::new())),
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(GatewayError::Network(format!(
                "unexpected interventions payload: {}",
                other
            )))
        }
    };
    serde_json::from_value(list)
        .map_err(|e| GatewayError::Network(format!("invalid interventions payload: {}", e)))
}
