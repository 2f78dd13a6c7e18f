//! 任务派发器
//!
//! 核心功能：
//! - 提交时校验访问级别，创建 queued 任务并按 FIFO 排队
//! - 运行中任务数不超过 max_concurrent_tasks，任何终态都会立即补位
//! - 高成本 / 长耗时任务委派给次级执行者
//! - 每次执行都有超时，支持取消（排队中直接移除，运行中协作式取消）
//! - 终态任务通过通知通道推送给上层
//!
//! 待执行队列、任务表、调用统计只在同一把锁下读写；锁内不 await。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::capability::{
    Capability, CapabilityRegistry, CapabilityStats, ExecutionContext, TaskReporter,
};
use super::delegation::{DelegationPolicy, SecondaryExecutor};
use super::task::{ExecutionTask, TaskId, TaskRequest, TaskStatus};
use crate::core::{EngineError, TaskFailure};
use crate::health::ExecutionMetrics;

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// 派发器配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchConfig {
    pub max_concurrent_tasks: usize,
    pub delegation: DelegationPolicy,
    /// 单个任务的执行上限
    pub task_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            delegation: DelegationPolicy::default(),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}

/// 任务进入终态时的通知（携带终态快照）
#[derive(Debug, Clone)]
pub struct TaskNotification {
    pub task: ExecutionTask,
}

#[derive(Default)]
struct DispatchState {
    tasks: HashMap<TaskId, ExecutionTask>,
    user_tasks: HashMap<String, Vec<TaskId>>,
    queue: VecDeque<TaskId>,
    running: usize,
    cancel_tokens: HashMap<TaskId, CancellationToken>,
    stats: HashMap<String, CapabilityStats>,
}

impl DispatchState {
    /// 写入终态；已是终态则返回 None（终态不可复活）
    fn finish(&mut self, task_id: &str, outcome: Result<Value, TaskFailure>) -> Option<ExecutionTask> {
        self.cancel_tokens.remove(task_id);
        let task = self.tasks.get_mut(task_id)?;
        if task.is_finished() {
            return None;
        }
        let was_running = task.status == TaskStatus::Running;
        task.completed_at = Some(Utc::now());

        let stats = self.stats.entry(task.capability_id.clone()).or_default();
        let cancelled = matches!(outcome, Err(TaskFailure::Cancelled));
        match outcome {
            Ok(value) => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.result = Some(value);
                stats.completed += 1;
                tracing::info!(task_id, delegated_to = ?task.delegated_to, "Task completed");
            }
            Err(failure) => {
                task.status = TaskStatus::Failed;
                task.error = Some(failure.to_string());
                if failure == TaskFailure::Cancelled {
                    stats.cancelled += 1;
                } else {
                    stats.failed += 1;
                }
                tracing::warn!(task_id, error = %failure, "Task failed");
            }
        }
        // 取消的运行不计入耗时（average_run_ms 只按 completed + failed 平均）
        if !cancelled {
            if let Some(ms) = task.run_duration_ms() {
                stats.total_run_ms += ms.max(0) as u64;
            }
        }
        if was_running {
            self.running = self.running.saturating_sub(1);
        }
        Some(task.clone())
    }
}

struct Inner {
    registry: CapabilityRegistry,
    delegate: Arc<dyn SecondaryExecutor>,
    config: DispatchConfig,
    state: Mutex<DispatchState>,
    notification_tx: mpsc::UnboundedSender<TaskNotification>,
    idle: Notify,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, finished: Option<ExecutionTask>) {
        if let Some(task) = finished {
            let _ = self.notification_tx.send(TaskNotification { task });
        }
        let idle = {
            let state = self.lock_state();
            state.running == 0 && state.queue.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn store_metrics(&self, task_id: &str, metrics: ExecutionMetrics) -> Result<bool, EngineError> {
        let mut state = self.lock_state();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if task.is_finished() {
            tracing::warn!(task_id, "Metrics reported after task finished, ignoring");
            return Ok(false);
        }
        task.metrics = Some(metrics);
        Ok(true)
    }
}

impl TaskReporter for Inner {
    fn report_progress(&self, task_id: &str, progress: u8) {
        let mut state = self.lock_state();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.progress = task.progress.max(progress.min(100));
                tracing::debug!(task_id, progress = task.progress, "progress");
            }
        }
    }

    fn report_metrics(&self, task_id: &str, metrics: ExecutionMetrics) {
        let _ = self.store_metrics(task_id, metrics);
    }
}

/// 任务派发器（由组合根创建一次，克隆句柄共享）
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

impl TaskDispatcher {
    /// 创建派发器，同时返回终态通知接收端
    pub fn new(
        registry: CapabilityRegistry,
        delegate: Arc<dyn SecondaryExecutor>,
        mut config: DispatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TaskNotification>) {
        config.max_concurrent_tasks = config.max_concurrent_tasks.max(1);
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry,
            delegate,
            config,
            state: Mutex::new(DispatchState::default()),
            notification_tx,
            idle: Notify::new(),
        });
        (Self { inner }, notification_rx)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    /// 提交任务；权限不足或能力不存在时同步拒绝，不入队。需在 tokio 运行时内调用
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        let capability = self
            .inner
            .registry
            .get(&request.capability_id)
            .ok_or_else(|| EngineError::CapabilityNotFound(request.capability_id.clone()))?;

        let required = capability.required_access();
        if !request.access_level.permits(required) {
            tracing::warn!(
                capability = %request.capability_id,
                user_id = %request.user_id,
                %required,
                actual = %request.access_level,
                "Submission rejected: insufficient access level"
            );
            return Err(EngineError::AccessDenied {
                capability: request.capability_id,
                required,
                actual: request.access_level,
            });
        }

        let task = ExecutionTask::new(request);
        let task_id = task.id.clone();
        {
            let mut state = self.inner.lock_state();
            state
                .user_tasks
                .entry(task.user_id.clone())
                .or_default()
                .push(task_id.clone());
            state.queue.push_back(task_id.clone());
            tracing::info!(
                task_id = %task_id,
                capability = %task.capability_id,
                model = %task.model,
                queued = state.queue.len(),
                "Task queued"
            );
            state.tasks.insert(task_id.clone(), task);
        }

        admit(&self.inner);
        Ok(task_id)
    }

    pub fn get_status(&self, task_id: &str) -> Option<ExecutionTask> {
        self.inner.lock_state().tasks.get(task_id).cloned()
    }

    /// 用户的全部任务（按提交顺序）
    pub fn list_for_user(&self, user_id: &str) -> Vec<ExecutionTask> {
        let state = self.inner.lock_state();
        state
            .user_tasks
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| state.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// 用户尚未结束的任务
    pub fn list_active_for_user(&self, user_id: &str) -> Vec<ExecutionTask> {
        self.list_for_user(user_id)
            .into_iter()
            .filter(|t| !t.is_finished())
            .collect()
    }

    /// 推理方上报遥测；任务已结束时忽略并返回 false
    pub fn report_metrics(&self, task_id: &str, metrics: ExecutionMetrics) -> Result<bool, EngineError> {
        self.inner.store_metrics(task_id, metrics)
    }

    /// 取消任务：排队中直接移除并标记失败；运行中触发协作式取消。已结束返回 false
    pub fn cancel(&self, task_id: &str) -> Result<bool, EngineError> {
        let finished = {
            let mut state = self.inner.lock_state();
            let status = state
                .tasks
                .get(task_id)
                .map(|t| t.status)
                .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
            match status {
                TaskStatus::Queued => {
                    state.queue.retain(|id| id != task_id);
                    state.finish(task_id, Err(TaskFailure::Cancelled))
                }
                TaskStatus::Running => {
                    if let Some(token) = state.cancel_tokens.get(task_id) {
                        token.cancel();
                    }
                    tracing::info!(task_id, "Cancellation requested for running task");
                    return Ok(true);
                }
                TaskStatus::Completed | TaskStatus::Failed => return Ok(false),
            }
        };
        self.inner.publish(finished);
        Ok(true)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock_state().running
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock_state();
        state.running == 0 && state.queue.is_empty()
    }

    /// 等待直到没有运行中或排队的任务
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn capability_stats(&self, capability_id: &str) -> CapabilityStats {
        self.inner
            .lock_state()
            .stats
            .get(capability_id)
            .copied()
            .unwrap_or_default()
    }

    /// 按委派对象统计任务数
    pub fn delegation_stats(&self) -> HashMap<String, u64> {
        let state = self.inner.lock_state();
        let mut counts = HashMap::new();
        for target in state.tasks.values().filter_map(|t| t.delegated_to.as_ref()) {
            *counts.entry(target.clone()).or_insert(0) += 1;
        }
        counts
    }
}

struct Launch {
    capability: Arc<dyn Capability>,
    ctx: ExecutionContext,
    delegated: bool,
}

/// 有空闲槽位时按 FIFO 取出排队任务并启动
fn admit(inner: &Arc<Inner>) {
    let mut launches = Vec::new();
    {
        let mut guard = inner.lock_state();
        let state = &mut *guard;
        while state.running < inner.config.max_concurrent_tasks {
            let Some(task_id) = state.queue.pop_front() else {
                break;
            };
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            // submit 已校验能力存在，注册表之后不再变化
            let Some(capability) = inner.registry.get(&task.capability_id) else {
                continue;
            };

            let delegated = inner.config.delegation.should_delegate(capability.as_ref());
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            if delegated {
                task.delegated_to = Some(inner.delegate.identity(capability.as_ref()));
            }

            let token = CancellationToken::new();
            let reporter: Arc<dyn TaskReporter> = Arc::clone(inner) as Arc<dyn TaskReporter>;
            let ctx = ExecutionContext::new(
                task.id.clone(),
                task.model.clone(),
                task.params.clone(),
                token.clone(),
                reporter,
            );
            tracing::info!(
                task_id = %task.id,
                capability = %task.capability_id,
                delegated_to = ?task.delegated_to,
                "Task started"
            );

            let stats = state.stats.entry(task.capability_id.clone()).or_default();
            stats.calls += 1;
            if delegated {
                stats.delegated += 1;
            }
            state.cancel_tokens.insert(task_id, token);
            state.running += 1;

            launches.push(Launch {
                capability,
                ctx,
                delegated,
            });
        }
    }

    for launch in launches {
        tokio::spawn(run_task(Arc::clone(inner), launch));
    }
}

async fn run_task(inner: Arc<Inner>, launch: Launch) {
    let Launch {
        capability,
        ctx,
        delegated,
    } = launch;
    let timeout = inner.config.task_timeout;
    let token = ctx.cancellation().clone();

    // 在独立任务中执行：能力 panic 只会落到 JoinError，不会带走本任务的收尾
    let execution = tokio::spawn({
        let inner = Arc::clone(&inner);
        let capability = Arc::clone(&capability);
        let ctx = ctx.clone();
        async move {
            if delegated {
                inner.delegate.execute(capability, &ctx).await
            } else {
                capability.execute(&ctx).await
            }
        }
    });
    let abort = execution.abort_handle();

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => {
            abort.abort();
            Err(TaskFailure::Cancelled)
        }
        result = tokio::time::timeout(timeout, execution) => match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(TaskFailure::ExecutionFailed(e)),
            Ok(Err(join_error)) => Err(join_failure(join_error)),
            Err(_) => {
                abort.abort();
                Err(TaskFailure::TimedOut { secs: timeout.as_secs() })
            }
        },
    };

    let finished = inner.lock_state().finish(&ctx.task_id, outcome);
    inner.publish(finished);
    admit(&inner);
}

fn join_failure(error: JoinError) -> TaskFailure {
    if !error.is_panic() {
        return TaskFailure::Cancelled;
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %message, "Capability panicked during execution");
    TaskFailure::ExecutionFailed(format!("capability panicked: {message}"))
}
