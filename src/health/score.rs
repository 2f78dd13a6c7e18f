//! 健康评分：把一次执行的遥测指标映射为 5 个维度的加权分数
//!
//! 权重：coherence 25%、accuracy 30%、context retention 20%、efficiency 15%、latency 10%。
//! 纯函数，没有错误分支；分母为 0 时该维度取中性值 1.0。

use serde::{Deserialize, Serialize};

const WEIGHT_COHERENCE: f64 = 0.25;
const WEIGHT_ACCURACY: f64 = 0.30;
const WEIGHT_CONTEXT: f64 = 0.20;
const WEIGHT_EFFICIENCY: f64 = 0.15;
const WEIGHT_LATENCY: f64 = 0.10;

/// 超过 prompt 的 3 倍开始扣效率分
const VERBOSITY_FREE_RATIO: f64 = 3.0;
/// 超出部分每 10 倍扣满
const VERBOSITY_PENALTY_SPAN: f64 = 10.0;
/// 延迟线性衰减到 0 的上限（毫秒）
const LATENCY_CEILING_MS: f64 = 10_000.0;

/// 单次执行的遥测（由外部推理调用方上报，提交后不可变）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub response_tokens: u64,
    pub prompt_tokens: u64,
    pub latency_ms: u64,
    pub factual_claims: u32,
    pub verified_claims: u32,
    pub context_references: u32,
    pub expected_context_refs: u32,
    pub logical_errors: u32,
    pub total_statements: u32,
}

/// 健康分（各维度与 overall 均在 [0,1]，保留两位小数）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub coherence: f64,
    pub accuracy: f64,
    pub context_retention: f64,
    pub efficiency: f64,
    pub latency_score: f64,
    pub overall: f64,
}

impl HealthScore {
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_overall(self.overall)
    }
}

/// 计算健康分
pub fn calculate_health_score(metrics: &ExecutionMetrics) -> HealthScore {
    let coherence = if metrics.total_statements > 0 {
        (1.0 - metrics.logical_errors as f64 / metrics.total_statements as f64).max(0.0)
    } else {
        1.0
    };

    // verified > factual 属于上报方数据错误，截断到 1 保持值域
    let accuracy = if metrics.factual_claims > 0 {
        (metrics.verified_claims as f64 / metrics.factual_claims as f64).min(1.0)
    } else {
        1.0
    };

    let context_retention = if metrics.expected_context_refs > 0 {
        (metrics.context_references as f64 / metrics.expected_context_refs as f64).min(1.0)
    } else {
        1.0
    };

    let ratio = if metrics.prompt_tokens > 0 {
        metrics.response_tokens as f64 / metrics.prompt_tokens as f64
    } else {
        1.0
    };
    let efficiency = if ratio <= VERBOSITY_FREE_RATIO {
        1.0
    } else {
        (1.0 - (ratio - VERBOSITY_FREE_RATIO) / VERBOSITY_PENALTY_SPAN).max(0.0)
    };

    let latency_score = (1.0 - metrics.latency_ms as f64 / LATENCY_CEILING_MS).max(0.0);

    let overall = coherence * WEIGHT_COHERENCE
        + accuracy * WEIGHT_ACCURACY
        + context_retention * WEIGHT_CONTEXT
        + efficiency * WEIGHT_EFFICIENCY
        + latency_score * WEIGHT_LATENCY;

    HealthScore {
        coherence: round2(coherence),
        accuracy: round2(accuracy),
        context_retention: round2(context_retention),
        efficiency: round2(efficiency),
        latency_score: round2(latency_score),
        overall: round2(overall),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 健康状态标签（供监控面板展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// overall >= 0.85
    Excellent,
    /// overall >= 0.65
    Good,
    Degraded,
}

impl HealthStatus {
    pub fn from_overall(overall: f64) -> Self {
        if overall >= 0.85 {
            HealthStatus::Excellent
        } else if overall >= 0.65 {
            HealthStatus::Good
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Excellent => "Excellent",
            HealthStatus::Good => "Good",
            HealthStatus::Degraded => "Degraded",
        }
    }

    /// 建议动作
    pub fn action(&self) -> &'static str {
        match self {
            HealthStatus::Excellent => "Continue",
            HealthStatus::Good => "Monitor",
            HealthStatus::Degraded => "Tap Out",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_unit(v: f64) -> bool {
        (0.0..=1.0).contains(&v)
    }

    fn healthy() -> ExecutionMetrics {
        ExecutionMetrics {
            response_tokens: 300,
            prompt_tokens: 200,
            latency_ms: 1_500,
            factual_claims: 10,
            verified_claims: 9,
            context_references: 4,
            expected_context_refs: 5,
            logical_errors: 1,
            total_statements: 10,
        }
    }

    #[test]
    fn test_zero_denominators_are_neutral() {
        let score = calculate_health_score(&ExecutionMetrics::default());
        assert_eq!(score.coherence, 1.0);
        assert_eq!(score.accuracy, 1.0);
        assert_eq!(score.context_retention, 1.0);
        assert_eq!(score.efficiency, 1.0);
        assert_eq!(score.latency_score, 1.0);
        assert_eq!(score.overall, 1.0);
    }

    #[test]
    fn test_weighted_overall() {
        let score = calculate_health_score(&healthy());
        assert_eq!(score.coherence, 0.9);
        assert_eq!(score.accuracy, 0.9);
        assert_eq!(score.context_retention, 0.8);
        assert_eq!(score.efficiency, 1.0);
        assert_eq!(score.latency_score, 0.85);
        // 0.225 + 0.27 + 0.16 + 0.15 + 0.085
        assert_eq!(score.overall, 0.89);
        assert_eq!(score.status(), HealthStatus::Excellent);
    }

    #[test]
    fn test_verbosity_penalty() {
        let mut m = ExecutionMetrics {
            prompt_tokens: 100,
            response_tokens: 300,
            ..Default::default()
        };
        assert_eq!(calculate_health_score(&m).efficiency, 1.0);

        m.response_tokens = 800; // ratio 8 -> 1 - 5/10
        assert_eq!(calculate_health_score(&m).efficiency, 0.5);

        m.response_tokens = 1_300; // ratio 13 -> 0
        assert_eq!(calculate_health_score(&m).efficiency, 0.0);

        m.response_tokens = 5_000;
        assert_eq!(calculate_health_score(&m).efficiency, 0.0);
    }

    #[test]
    fn test_latency_decays_to_zero() {
        let mut m = ExecutionMetrics {
            latency_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(calculate_health_score(&m).latency_score, 0.5);
        m.latency_ms = 10_000;
        assert_eq!(calculate_health_score(&m).latency_score, 0.0);
        m.latency_ms = 60_000;
        assert_eq!(calculate_health_score(&m).latency_score, 0.0);
    }

    #[test]
    fn test_scores_stay_in_unit_range() {
        let cases = [
            ExecutionMetrics {
                logical_errors: 50,
                total_statements: 10,
                verified_claims: 7,
                factual_claims: 3,
                context_references: 9,
                expected_context_refs: 2,
                response_tokens: 100_000,
                prompt_tokens: 1,
                latency_ms: u64::MAX / 2,
            },
            ExecutionMetrics {
                response_tokens: 0,
                prompt_tokens: 10_000,
                ..Default::default()
            },
            healthy(),
        ];
        for m in cases {
            let s = calculate_health_score(&m);
            for v in [
                s.coherence,
                s.accuracy,
                s.context_retention,
                s.efficiency,
                s.latency_score,
                s.overall,
            ] {
                assert!(in_unit(v), "{v} out of range for {m:?}");
            }
        }
    }

    #[test]
    fn test_scores_stay_in_unit_range_across_edge_values() {
        let small = [0u32, 1, 7, 1_000, u32::MAX];
        let wide = [0u64, 1, 7, 1_000, 10_000, u64::MAX];

        // 每对分子/分母都覆盖 分子 < 分母、相等、分子 > 分母
        for &a in &small {
            for &b in &small {
                for (i, &latency_ms) in wide.iter().enumerate() {
                    let tokens = wide[(i + a as usize % 3) % wide.len()];
                    let cases = [
                        ExecutionMetrics {
                            logical_errors: a,
                            total_statements: b,
                            verified_claims: b,
                            factual_claims: a,
                            context_references: a,
                            expected_context_refs: b,
                            response_tokens: tokens,
                            prompt_tokens: latency_ms,
                            latency_ms,
                        },
                        ExecutionMetrics {
                            logical_errors: b,
                            total_statements: a,
                            verified_claims: a,
                            factual_claims: b,
                            context_references: b,
                            expected_context_refs: a,
                            response_tokens: latency_ms,
                            prompt_tokens: tokens,
                            latency_ms: tokens,
                        },
                    ];
                    for m in cases {
                        let s = calculate_health_score(&m);
                        for v in [
                            s.coherence,
                            s.accuracy,
                            s.context_retention,
                            s.efficiency,
                            s.latency_score,
                            s.overall,
                        ] {
                            assert!(in_unit(v), "{v} out of range for {m:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(HealthStatus::from_overall(0.85), HealthStatus::Excellent);
        assert_eq!(HealthStatus::from_overall(0.65), HealthStatus::Good);
        assert_eq!(HealthStatus::from_overall(0.64), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.action(), "Tap Out");
    }
}
