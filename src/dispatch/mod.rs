//! 任务派发：能力注册、访问控制、并发上限、委派、取消与超时

pub mod capability;
pub mod delegation;
pub mod dispatcher;
pub mod task;

pub use capability::{
    Capability, CapabilityRegistry, CapabilityStats, CostRange, ExecutionContext, TaskReporter,
    TimeRange,
};
pub use delegation::{
    select_delegate_target, DelegationPolicy, SecondaryExecutor, SkillRoutedDelegate,
    DEFAULT_DELEGATION_COST_THRESHOLD, DEFAULT_DELEGATION_TIME_THRESHOLD_SECS,
    DEFAULT_SECONDARY_EXECUTOR,
};
pub use dispatcher::{
    DispatchConfig, TaskDispatcher, TaskNotification, DEFAULT_MAX_CONCURRENT_TASKS,
    DEFAULT_TASK_TIMEOUT_SECS,
};
pub use task::{AccessLevel, ExecutionTask, TaskId, TaskRequest, TaskStatus};
