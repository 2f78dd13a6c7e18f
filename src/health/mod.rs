//! 健康层：执行指标评分与模型轮换策略

pub mod rotation;
pub mod score;

pub use rotation::{
    default_model_tiers, should_tap_out, ModelTier, RotationDecision, RotationPolicy, TierName,
    TierTable, DEFAULT_SEVERE_DEGRADATION_LEVEL, DEFAULT_TAP_OUT_THRESHOLD,
};
pub use score::{calculate_health_score, ExecutionMetrics, HealthScore, HealthStatus};
