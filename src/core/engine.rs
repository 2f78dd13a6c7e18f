//! 轮换引擎：把派发、评分、轮换与台账串成一条完成管线
//!
//! 每个终态任务依次经过：评分（有遥测时）-> 轮换决策 -> 更新能力的模型槽位 -> 记账 -> 失败则退款。
//! 模型槽位按能力 id 维护；并发完成的任务只有在槽位仍指向自己所用模型时才会改写槽位，
//! 避免同一模型的多个失败任务连续降档。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use super::error::EngineError;
use crate::config::AppConfig;
use crate::dispatch::{
    AccessLevel, CapabilityRegistry, ExecutionTask, SecondaryExecutor, SkillRoutedDelegate,
    TaskDispatcher, TaskId, TaskNotification, TaskRequest, TaskStatus,
};
use crate::health::{calculate_health_score, HealthScore, RotationDecision, RotationPolicy};
use crate::ledger::{CostLedger, LedgerBook, LedgerEntry, PaymentProcessor, RefundOutcome};

/// 一个终态任务走完完成管线后的结果
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub task: ExecutionTask,
    /// 没有遥测时为 None（不评分、不轮换）
    pub health: Option<HealthScore>,
    pub rotation: Option<RotationDecision>,
    /// 最终台账记录（若已退款则为退款后的状态）
    pub entry: LedgerEntry,
    /// 仅失败任务会尝试退款
    pub refund: Option<RefundOutcome>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RotationEngine {
    policy: RotationPolicy,
    ledger: CostLedger,
    book: LedgerBook,
    dispatcher: TaskDispatcher,
    payments: Arc<dyn PaymentProcessor>,
    initial_model: String,
    /// capability_id -> 当前模型
    slots: Mutex<HashMap<String, String>>,
    /// model -> 最近一次健康分
    health: Mutex<HashMap<String, HealthScore>>,
}

impl RotationEngine {
    /// 按配置构建引擎（次级执行者按技能路由），并启动完成管线。需在 tokio 运行时内调用
    pub fn start(
        config: &AppConfig,
        registry: CapabilityRegistry,
        payments: Arc<dyn PaymentProcessor>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CompletionReport>), EngineError> {
        let delegate = Arc::new(SkillRoutedDelegate::new(
            config.dispatch.secondary_executor.clone(),
        ));
        Self::start_with_delegate(config, registry, delegate, payments)
    }

    /// 同 start，但使用自定义次级执行者
    pub fn start_with_delegate(
        config: &AppConfig,
        registry: CapabilityRegistry,
        delegate: Arc<dyn SecondaryExecutor>,
        payments: Arc<dyn PaymentProcessor>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CompletionReport>), EngineError> {
        let policy = config.rotation.policy()?;
        let ledger = config.pricing.cost_ledger()?;
        let dispatch_config = config.dispatch.dispatch_config()?;
        let (dispatcher, notifications) = TaskDispatcher::new(registry, delegate, dispatch_config);

        let engine = Arc::new(Self {
            policy,
            ledger,
            book: LedgerBook::new(),
            dispatcher,
            payments,
            initial_model: config.rotation.initial_model.clone(),
            slots: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
        });

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        tokio::spawn(completion_loop(
            Arc::downgrade(&engine),
            notifications,
            report_tx,
        ));
        tracing::info!(
            capabilities = engine.dispatcher.registry().len(),
            initial_model = %engine.initial_model,
            "Rotation engine started"
        );
        Ok((engine, report_rx))
    }

    /// 以能力当前槽位的模型提交任务
    pub fn submit(
        &self,
        capability_id: &str,
        params: Value,
        user_id: &str,
        access_level: AccessLevel,
    ) -> Result<TaskId, EngineError> {
        let model = self
            .current_model(capability_id)
            .ok_or_else(|| EngineError::CapabilityNotFound(capability_id.to_string()))?;
        self.dispatcher.submit(TaskRequest {
            capability_id: capability_id.to_string(),
            model,
            params,
            user_id: user_id.to_string(),
            access_level,
        })
    }

    /// 能力下一次任务将使用的模型；能力未注册时为 None
    pub fn current_model(&self, capability_id: &str) -> Option<String> {
        let capability = self.dispatcher.registry().get(capability_id)?;
        let mut slots = lock(&self.slots);
        let model = slots.entry(capability_id.to_string()).or_insert_with(|| {
            match capability.preferred_model() {
                Some(m) if self.policy.tiers().contains(m) => m.to_string(),
                Some(m) => {
                    tracing::warn!(
                        capability = capability_id,
                        preferred = m,
                        "Preferred model is not in any tier, using initial model"
                    );
                    self.initial_model.clone()
                }
                None => self.initial_model.clone(),
            }
        });
        Some(model.clone())
    }

    pub fn latest_health(&self, model: &str) -> Option<HealthScore> {
        lock(&self.health).get(model).copied()
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn ledger_book(&self) -> &LedgerBook {
        &self.book
    }

    pub fn cost_ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// 完成管线：评分 -> 轮换 -> 记账 -> 失败退款
    pub async fn handle_finished(&self, task: ExecutionTask) -> Result<CompletionReport, EngineError> {
        if !task.is_finished() {
            return Err(EngineError::TaskNotFound(format!(
                "{} has not finished",
                task.id
            )));
        }

        let health = task.metrics.as_ref().map(calculate_health_score);
        let rotation = match &health {
            Some(score) => {
                lock(&self.health).insert(task.model.clone(), *score);
                match self.policy.decide(&task.model, score) {
                    Ok(decision) => {
                        self.apply_rotation(&task.capability_id, &decision);
                        Some(decision)
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "Rotation skipped");
                        None
                    }
                }
            }
            None => None,
        };

        let (input_tokens, output_tokens) = task
            .metrics
            .map(|m| (m.prompt_tokens, m.response_tokens))
            .unwrap_or((0, 0));
        let success = task.status == TaskStatus::Completed;
        let mut entry = self.ledger.create_ledger_entry(
            &task.id,
            &task.user_id,
            &task.model,
            input_tokens,
            output_tokens,
            success,
        );
        self.book.record(entry.clone()).await?;

        let refund = if success {
            None
        } else {
            let reason = task.error.clone().unwrap_or_else(|| "task failed".to_string());
            let outcome = self
                .book
                .refund(&task.id, &reason, self.payments.as_ref())
                .await?;
            if let RefundOutcome::Refunded(updated) = &outcome {
                entry = updated.clone();
            }
            Some(outcome)
        };

        Ok(CompletionReport {
            task,
            health,
            rotation,
            entry,
            refund,
        })
    }

    fn apply_rotation(&self, capability_id: &str, decision: &RotationDecision) {
        let RotationDecision::TagIn { from, to, .. } = decision else {
            return;
        };
        let mut slots = lock(&self.slots);
        match slots.get_mut(capability_id) {
            Some(current) if current == from => {
                tracing::info!(capability = capability_id, from = %from, to = %to, "Model tagged in");
                *current = to.clone();
            }
            Some(current) => {
                tracing::debug!(
                    capability = capability_id,
                    current = %current,
                    stale = %from,
                    "Slot already rotated, ignoring stale decision"
                );
            }
            None => {
                slots.insert(capability_id.to_string(), to.clone());
            }
        }
    }
}

async fn completion_loop(
    engine: Weak<RotationEngine>,
    mut notifications: mpsc::UnboundedReceiver<TaskNotification>,
    reports: mpsc::UnboundedSender<CompletionReport>,
) {
    while let Some(TaskNotification { task }) = notifications.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let task_id = task.id.clone();
        match engine.handle_finished(task).await {
            Ok(report) => {
                let _ = reports.send(report);
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Completion pipeline failed");
            }
        }
    }
    tracing::debug!("completion loop stopped");
}
