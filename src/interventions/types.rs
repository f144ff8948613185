//! 干预（系统生成的建议）数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 干预类别；未识别的类别归入 `Other`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    BurnoutPrevention,
    StressPurchase,
    TrainingOptimization,
    CalendarConflict,
    RecoveryWarning,
    FinancialAlert,
    SleepIntervention,
    NutritionAdjustment,
    #[serde(other)]
    Other,
}

impl Default for InterventionType {
    fn default() -> Self {
        Self::Other
    }
}

/// 干预状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    Active,
    Dismissed,
    Rejected,
}

impl Default for InterventionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// 单条干预
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: InterventionType,
    #[serde(default)]
    pub title: Option<String>,
    /// [0, 1]
    #[serde(default)]
    pub confidence: f64,
    /// [0, 1]
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub status: InterventionStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    /// 本地记录：是否已发出过“新待处理”通知，一旦为 true 不再回退
    #[serde(default)]
    pub notified: bool,
}

impl Intervention {
    pub fn new(id: impl Into<String>, kind: InterventionType, confidence: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            title: None,
            confidence: confidence.clamp(0.0, 1.0),
            priority: 0.0,
            status: InterventionStatus::Pending,
            created_at: Some(Utc::now()),
            approved_at: None,
            notified: false,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// confidence ≥ threshold 时自动审批
    pub fn qualifies_for_auto_approval(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}
