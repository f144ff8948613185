//! Butler 动作类型与后端路由
//!
//! 已知动作是封闭枚举，执行时穷尽匹配；从外部以字符串到达的类型名
//! 在入队时接受，无法识别的到执行时才以 `UnknownTaskType` 失败。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::CallDescriptor;

/// 已知的 Butler 动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ScheduleMeeting,
    RescheduleEvent,
    BlockTransaction,
    AdjustWorkout,
    OrderMeal,
    BookRecovery,
    SendMessage,
    UpdateGoal,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::ScheduleMeeting,
        ActionKind::RescheduleEvent,
        ActionKind::BlockTransaction,
        ActionKind::AdjustWorkout,
        ActionKind::OrderMeal,
        ActionKind::BookRecovery,
        ActionKind::SendMessage,
        ActionKind::UpdateGoal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ScheduleMeeting => "schedule_meeting",
            ActionKind::RescheduleEvent => "reschedule_event",
            ActionKind::BlockTransaction => "block_transaction",
            ActionKind::AdjustWorkout => "adjust_workout",
            ActionKind::OrderMeal => "order_meal",
            ActionKind::BookRecovery => "book_recovery",
            ActionKind::SendMessage => "send_message",
            ActionKind::UpdateGoal => "update_goal",
        }
    }

    /// 该动作对应的后端调用
    pub fn to_call(&self, params: &Value) -> CallDescriptor {
        match self {
            ActionKind::ScheduleMeeting => CallDescriptor::post(
                "/phoenix/butler/calendar",
                merge(json!({ "action": "schedule" }), params),
            ),
            ActionKind::RescheduleEvent => CallDescriptor::post(
                "/phoenix/butler/calendar",
                merge(json!({ "action": "reschedule" }), params),
            ),
            ActionKind::OrderMeal => CallDescriptor::post("/phoenix/butler/food", params.clone()),
            ActionKind::SendMessage => {
                let path = match params.get("channel").and_then(Value::as_str) {
                    Some("email") => "/phoenix/butler/email",
                    Some("call") => "/phoenix/butler/call",
                    _ => "/phoenix/butler/sms",
                };
                CallDescriptor::post(path, params.clone())
            }
            ActionKind::BlockTransaction
            | ActionKind::AdjustWorkout
            | ActionKind::BookRecovery
            | ActionKind::UpdateGoal => CallDescriptor::post(
                "/phoenix/butler/execute",
                json!({ "action": self.as_str(), "params": params }),
            ),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// 任务携带的类型：已知动作，或入队时无法识别的名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskType {
    Known(ActionKind),
    Unrecognized(String),
}

impl TaskType {
    pub fn from_name(name: &str) -> Self {
        match name.parse() {
            Ok(kind) => TaskType::Known(kind),
            Err(_) => TaskType::Unrecognized(name.to_string()),
        }
    }
}

impl From<ActionKind> for TaskType {
    fn from(kind: ActionKind) -> Self {
        TaskType::Known(kind)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Known(kind) => kind.fmt(f),
            TaskType::Unrecognized(name) => f.write_str(name),
        }
    }
}

/// 把 `params` 的对象字段并入 `base`（base 中的键优先）
fn merge(mut base: Value, params: &Value) -> Value {
    if let (Some(target), Some(extra)) = (base.as_object_mut(), params.as_object()) {
        for (k, v) in extra {
            target.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    base
}
