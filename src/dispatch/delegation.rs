//! 委派：高成本 / 长耗时任务交给次级执行者
//!
//! 能力的成本上限超过阈值（默认 $0.20）或耗时上限超过阈值（默认 60s）即委派。
//! 派发器仍负责生命周期与进度，只在任务上标记 delegated_to。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::capability::{Capability, ExecutionContext};

pub const DEFAULT_DELEGATION_COST_THRESHOLD: f64 = 0.20;
pub const DEFAULT_DELEGATION_TIME_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_SECONDARY_EXECUTOR: &str = "Boomer_Ang";

/// 委派阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelegationPolicy {
    pub cost_threshold: f64,
    pub time_threshold_secs: u64,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            cost_threshold: DEFAULT_DELEGATION_COST_THRESHOLD,
            time_threshold_secs: DEFAULT_DELEGATION_TIME_THRESHOLD_SECS,
        }
    }
}

impl DelegationPolicy {
    pub fn should_delegate(&self, capability: &dyn Capability) -> bool {
        capability.estimated_cost().max > self.cost_threshold
            || capability.estimated_time().max_secs > self.time_threshold_secs
    }
}

/// 按技能标签选择委派对象，未命中时用默认执行者
pub fn select_delegate_target(skills: &[String], default_agent: &str) -> String {
    let has = |names: &[&str]| skills.iter().any(|s| names.contains(&s.as_str()));

    if has(&["deep-research", "web-search"]) {
        "research-agent".to_string()
    } else if has(&["content-generation", "code-synthesis"]) {
        "content-agent".to_string()
    } else if has(&["workflow-automation", "script-generation", "browser-automation"]) {
        "automation-agent".to_string()
    } else {
        default_agent.to_string()
    }
}

/// 次级执行路径
#[async_trait]
pub trait SecondaryExecutor: Send + Sync {
    /// 接手该能力的执行者名称（写入 delegated_to）
    fn identity(&self, capability: &dyn Capability) -> String;

    async fn execute(
        &self,
        capability: Arc<dyn Capability>,
        ctx: &ExecutionContext,
    ) -> Result<Value, String>;
}

/// 默认次级执行者：按技能路由身份，在本进程内运行能力
#[derive(Debug, Clone)]
pub struct SkillRoutedDelegate {
    default_agent: String,
}

impl SkillRoutedDelegate {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            default_agent: default_agent.into(),
        }
    }
}

impl Default for SkillRoutedDelegate {
    fn default() -> Self {
        Self::new(DEFAULT_SECONDARY_EXECUTOR)
    }
}

#[async_trait]
impl SecondaryExecutor for SkillRoutedDelegate {
    fn identity(&self, capability: &dyn Capability) -> String {
        select_delegate_target(&capability.skills(), &self.default_agent)
    }

    async fn execute(
        &self,
        capability: Arc<dyn Capability>,
        ctx: &ExecutionContext,
    ) -> Result<Value, String> {
        tracing::debug!(task_id = %ctx.task_id, capability = capability.id(), "running delegated task");
        capability.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CostRange, TimeRange};

    struct Plug {
        cost: CostRange,
        time: TimeRange,
        skills: Vec<String>,
    }

    #[async_trait]
    impl Capability for Plug {
        fn id(&self) -> &str {
            "sized"
        }

        fn estimated_cost(&self) -> CostRange {
            self.cost
        }

        fn estimated_time(&self) -> TimeRange {
            self.time
        }

        fn skills(&self) -> Vec<String> {
            self.skills.clone()
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    fn sized(max_cost: f64, max_secs: u64) -> Plug {
        Plug {
            cost: CostRange::new(0.01, max_cost),
            time: TimeRange::new(1, max_secs),
            skills: Vec::new(),
        }
    }

    #[test]
    fn test_expensive_capability_is_delegated() {
        let policy = DelegationPolicy::default();
        assert!(policy.should_delegate(&sized(0.25, 10)));
    }

    #[test]
    fn test_slow_capability_is_delegated() {
        let policy = DelegationPolicy::default();
        assert!(policy.should_delegate(&sized(0.05, 120)));
    }

    #[test]
    fn test_cheap_fast_capability_runs_locally() {
        let policy = DelegationPolicy::default();
        assert!(!policy.should_delegate(&sized(0.10, 30)));
        // 阈值本身不触发
        assert!(!policy.should_delegate(&sized(0.20, 60)));
    }

    #[test]
    fn test_delegate_target_routing() {
        let skills = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(
            select_delegate_target(&skills(&["web-search"]), "Boomer_Ang"),
            "research-agent"
        );
        assert_eq!(
            select_delegate_target(&skills(&["code-synthesis"]), "Boomer_Ang"),
            "content-agent"
        );
        assert_eq!(
            select_delegate_target(&skills(&["browser-automation"]), "Boomer_Ang"),
            "automation-agent"
        );
        assert_eq!(
            select_delegate_target(&skills(&["pdf-processing"]), "Boomer_Ang"),
            "Boomer_Ang"
        );

        let delegate = SkillRoutedDelegate::default();
        let mut cap = sized(0.5, 10);
        cap.skills = skills(&["deep-research"]);
        assert_eq!(delegate.identity(&cap), "research-agent");
    }
}
