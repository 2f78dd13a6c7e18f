//! 引擎错误类型与任务失败原因
//!
//! EngineError 只在配置装载、提交校验、台账写入等同步边界上返回；
//! 任务执行期的失败统一记为 TaskFailure，写入 ExecutionTask.error，不会跨越公共 API 抛出。

use thiserror::Error;

use crate::dispatch::AccessLevel;

/// 引擎对外返回的错误（配置、权限、查找失败等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Config error: {0}")]
    ConfigError(String),

    /// 模型不在任何 tier 中；select_next_model 没有安全的兜底，必须显式报错
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Access denied for capability {capability}: requires {required}, caller has {actual}")]
    AccessDenied {
        capability: String,
        required: AccessLevel,
        actual: AccessLevel,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// 每个任务只允许产生一条台账记录
    #[error("Duplicate ledger entry for task {0}")]
    DuplicateLedgerEntry(String),
}

/// 任务进入 failed 终态的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("task timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("task cancelled")]
    Cancelled,
}
