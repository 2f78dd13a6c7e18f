//! 执行任务与访问级别
//!
//! 状态机：queued -> running -> completed | failed，终态不可复活。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::ExecutionMetrics;

/// 任务 ID
pub type TaskId = String;

/// 访问级别，全序：public < partners < ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Partners,
    Ownership,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Public
    }
}

impl AccessLevel {
    /// 调用方级别是否满足所需级别
    pub fn permits(&self, required: AccessLevel) -> bool {
        *self >= required
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Public => write!(f, "public"),
            AccessLevel::Partners => write!(f, "partners"),
            AccessLevel::Ownership => write!(f, "ownership"),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待并发槽位
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 提交请求
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub capability_id: String,
    /// 本次执行使用的模型
    pub model: String,
    pub params: serde_json::Value,
    pub user_id: String,
    pub access_level: AccessLevel,
}

/// 执行任务（提交后由派发器独占，直到终态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub id: TaskId,
    pub capability_id: String,
    pub model: String,
    pub params: serde_json::Value,
    pub user_id: String,
    pub access_level: AccessLevel,
    pub status: TaskStatus,
    /// 进度（0-100），仅供展示
    pub progress: u8,
    /// 被委派时的次级执行者
    pub delegated_to: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 推理方上报的遥测
    pub metrics: Option<ExecutionMetrics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionTask {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            capability_id: request.capability_id,
            model: request.model,
            params: request.params,
            user_id: request.user_id,
            access_level: request.access_level,
            status: TaskStatus::Queued,
            progress: 0,
            delegated_to: None,
            result: None,
            error: None,
            metrics: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 实际运行时长（毫秒）
    pub fn run_duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds())
    }
}
