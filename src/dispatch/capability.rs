//! 能力注册表
//!
//! 外部插件实现 Capability trait（所需权限、成本/耗时估计、异步执行），由 CapabilityRegistry 按 id 注册与查找。
//! 执行时通过 ExecutionContext 回报进度与遥测，写入统一经过派发器的锁。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::task::{AccessLevel, TaskId};
use crate::health::ExecutionMetrics;

/// 预估成本区间（美元）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRange {
    pub min: f64,
    pub max: f64,
}

impl CostRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// 解析 "$0.05-0.15" 形式
impl FromStr for CostRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid cost range: {s}"))?;
        let parse = |part: &str| {
            part.trim()
                .trim_start_matches('$')
                .parse::<f64>()
                .map_err(|e| format!("invalid cost range {s}: {e}"))
        };
        Ok(Self::new(parse(lo)?, parse(hi)?))
    }
}

/// 预估耗时区间（秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl TimeRange {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }
}

/// 解析 "30-60 seconds" 形式
impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid time range: {s}"))?;
        let hi = hi.split_whitespace().next().unwrap_or("");
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid time range {s}: {e}"))
        };
        Ok(Self::new(parse(lo)?, parse(hi)?))
    }
}

/// 执行期回报通道（由派发器实现）
pub trait TaskReporter: Send + Sync {
    fn report_progress(&self, task_id: &str, progress: u8);
    fn report_metrics(&self, task_id: &str, metrics: ExecutionMetrics);
}

/// 传给能力实现的执行上下文
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub model: String,
    pub params: Value,
    cancel: CancellationToken,
    reporter: Arc<dyn TaskReporter>,
}

impl ExecutionContext {
    pub fn new(
        task_id: TaskId,
        model: String,
        params: Value,
        cancel: CancellationToken,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            task_id,
            model,
            params,
            cancel,
            reporter,
        }
    }

    /// 进度只增不减，超过 100 截断
    pub fn report_progress(&self, progress: u8) {
        self.reporter.report_progress(&self.task_id, progress);
    }

    pub fn report_metrics(&self, metrics: ExecutionMetrics) {
        self.reporter.report_metrics(&self.task_id, metrics);
    }

    /// 协作式取消：长时间运行的能力应在检查点上查看
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// 能力 trait：id、所需权限、成本/耗时估计、异步执行
#[async_trait]
pub trait Capability: Send + Sync {
    fn id(&self) -> &str;

    fn required_access(&self) -> AccessLevel {
        AccessLevel::Public
    }

    fn estimated_cost(&self) -> CostRange;

    fn estimated_time(&self) -> TimeRange;

    /// 技能标签（用于选择委派对象）
    fn skills(&self) -> Vec<String> {
        Vec::new()
    }

    /// 首选模型；None 时使用配置的初始模型
    fn preferred_model(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, String>;
}

/// 能力注册表：按 id 存储 Arc<dyn Capability>
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let id = capability.id().to_string();
        if self.capabilities.insert(id.clone(), capability).is_some() {
            tracing::warn!(capability = %id, "Capability re-registered, replacing previous entry");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// 单个能力的调用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityStats {
    pub calls: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub delegated: u64,
    pub total_run_ms: u64,
}

impl CapabilityStats {
    pub fn average_run_ms(&self) -> Option<u64> {
        let finished = self.completed + self.failed;
        if finished == 0 {
            None
        } else {
            Some(self.total_run_ms / finished)
        }
    }
}
