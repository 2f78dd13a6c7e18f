//! 模型轮换：Tap-out 判定 + Tag-in 选模
//!
//! - tap out：overall 低于阈值（默认 0.65）即交棒
//! - tag in：严重退化（默认 < 0.5）且不在最低档时降一档取首个模型，否则同档轮询
//!
//! 档位归属在装载时建成 model -> tier 的唯一索引，重复归属直接视为配置错误。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::score::HealthScore;
use crate::core::EngineError;

pub const DEFAULT_TAP_OUT_THRESHOLD: f64 = 0.65;
pub const DEFAULT_SEVERE_DEGRADATION_LEVEL: f64 = 0.5;

/// 档位名，全序：Premium > Standard > Economy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TierName {
    Economy,
    Standard,
    Premium,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Premium => "Premium",
            TierName::Standard => "Standard",
            TierName::Economy => "Economy",
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 一个档位：有序模型列表 + 成本系数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTier {
    pub name: TierName,
    pub models: Vec<String>,
    pub cost_multiplier: f64,
}

impl ModelTier {
    pub fn new(name: TierName, models: &[&str], cost_multiplier: f64) -> Self {
        Self {
            name,
            models: models.iter().map(|m| m.to_string()).collect(),
            cost_multiplier,
        }
    }
}

/// 内置档位表
pub fn default_model_tiers() -> Vec<ModelTier> {
    vec![
        ModelTier::new(
            TierName::Premium,
            &["gemini-2.5-pro", "claude-3.5-sonnet", "gpt-4o"],
            1.0,
        ),
        ModelTier::new(
            TierName::Standard,
            &["gemini-2.0-flash", "claude-3-haiku", "deepseek-r1"],
            0.3,
        ),
        ModelTier::new(
            TierName::Economy,
            &["gemini-1.5-flash", "llama-3.3-70b", "qwen-2.5-72b"],
            0.1,
        ),
    ]
}

/// 档位表：按档位从高到低排列，附 model -> tier 唯一索引
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<ModelTier>,
    index: HashMap<String, TierName>,
}

impl TierTable {
    /// 校验并建表：档位不可重复、不可为空，模型只能属于一个档位
    pub fn new(mut tiers: Vec<ModelTier>) -> Result<Self, EngineError> {
        if tiers.is_empty() {
            return Err(EngineError::ConfigError("no model tiers configured".into()));
        }
        tiers.sort_by(|a, b| b.name.cmp(&a.name));

        let mut index = HashMap::new();
        for (i, tier) in tiers.iter().enumerate() {
            if i > 0 && tiers[i - 1].name == tier.name {
                return Err(EngineError::ConfigError(format!(
                    "tier {} configured more than once",
                    tier.name
                )));
            }
            if tier.models.is_empty() {
                return Err(EngineError::ConfigError(format!(
                    "tier {} has no models",
                    tier.name
                )));
            }
            for model in &tier.models {
                if let Some(existing) = index.insert(model.clone(), tier.name) {
                    return Err(EngineError::ConfigError(format!(
                        "model {model} appears in both {existing} and {} tiers",
                        tier.name
                    )));
                }
            }
        }

        Ok(Self { tiers, index })
    }

    pub fn tier_of(&self, model: &str) -> Option<&ModelTier> {
        let name = self.index.get(model)?;
        self.tier(*name)
    }

    pub fn tier(&self, name: TierName) -> Option<&ModelTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// 紧邻的更低一档；已是最低档时返回 None
    pub fn lower_tier(&self, name: TierName) -> Option<&ModelTier> {
        self.tiers.iter().find(|t| t.name < name)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.index.contains_key(model)
    }

    pub fn tiers(&self) -> &[ModelTier] {
        &self.tiers
    }
}

impl Default for TierTable {
    fn default() -> Self {
        let tiers = default_model_tiers();
        let index = tiers
            .iter()
            .flat_map(|t| t.models.iter().map(move |m| (m.clone(), t.name)))
            .collect();
        Self { tiers, index }
    }
}

/// 健康分低于阈值即应交棒
pub fn should_tap_out(score: &HealthScore, threshold: f64) -> bool {
    score.overall < threshold
}

/// 一次轮换决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RotationDecision {
    /// 健康，继续使用当前模型
    Stay { model: String },
    /// 交棒给新模型
    TagIn {
        from: String,
        to: String,
        overall: f64,
    },
}

impl RotationDecision {
    /// 下一次任务应使用的模型
    pub fn next_model(&self) -> &str {
        match self {
            RotationDecision::Stay { model } => model,
            RotationDecision::TagIn { to, .. } => to,
        }
    }
}

/// 无状态轮换策略：每次都由最新健康分重新计算
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    tiers: TierTable,
    tap_out_threshold: f64,
    severe_degradation_level: f64,
}

impl RotationPolicy {
    pub fn new(tiers: TierTable, tap_out_threshold: f64, severe_degradation_level: f64) -> Self {
        Self {
            tiers,
            tap_out_threshold,
            severe_degradation_level,
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn tap_out_threshold(&self) -> f64 {
        self.tap_out_threshold
    }

    pub fn should_tap_out(&self, score: &HealthScore) -> bool {
        should_tap_out(score, self.tap_out_threshold)
    }

    /// 选出接棒模型；current_model 不在任何档位时返回 UnknownModel
    pub fn select_next_model(
        &self,
        current_model: &str,
        degradation_level: f64,
    ) -> Result<String, EngineError> {
        let tier = self.tiers.tier_of(current_model).ok_or_else(|| {
            tracing::error!(model = current_model, "tag-in lookup for unconfigured model");
            EngineError::UnknownModel(current_model.to_string())
        })?;

        if degradation_level < self.severe_degradation_level {
            if let Some(lower) = self.tiers.lower_tier(tier.name) {
                if let Some(first) = lower.models.first() {
                    return Ok(first.clone());
                }
            }
        }

        let position = tier
            .models
            .iter()
            .position(|m| m == current_model)
            .unwrap_or(0);
        let next = (position + 1) % tier.models.len();
        Ok(tier.models[next].clone())
    }

    /// 组合 tap-out 判定与 tag-in 选模，退化程度取 overall
    pub fn decide(
        &self,
        current_model: &str,
        score: &HealthScore,
    ) -> Result<RotationDecision, EngineError> {
        if !self.should_tap_out(score) {
            return Ok(RotationDecision::Stay {
                model: current_model.to_string(),
            });
        }
        let to = self.select_next_model(current_model, score.overall)?;
        tracing::info!(
            from = current_model,
            to = %to,
            overall = score.overall,
            "Agent tapped out"
        );
        Ok(RotationDecision::TagIn {
            from: current_model.to_string(),
            to,
            overall: score.overall,
        })
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::new(
            TierTable::default(),
            DEFAULT_TAP_OUT_THRESHOLD,
            DEFAULT_SEVERE_DEGRADATION_LEVEL,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(overall: f64) -> HealthScore {
        HealthScore {
            coherence: 1.0,
            accuracy: 1.0,
            context_retention: 1.0,
            efficiency: 1.0,
            latency_score: 1.0,
            overall,
        }
    }

    #[test]
    fn test_tap_out_boundary() {
        assert!(!should_tap_out(&score(0.65), 0.65));
        assert!(should_tap_out(&score(0.649999), 0.65));
        assert!(!should_tap_out(&score(0.9), 0.65));

        let policy = RotationPolicy::default();
        assert!(!policy.should_tap_out(&score(0.65)));
        assert!(policy.should_tap_out(&score(0.649999)));
    }

    #[test]
    fn test_round_robin_visits_every_model_once() {
        let policy = RotationPolicy::default();
        let tier = policy.tiers().tier(TierName::Standard).unwrap().clone();

        let mut current = tier.models[0].clone();
        let mut seen = vec![current.clone()];
        for _ in 1..tier.models.len() {
            current = policy.select_next_model(&current, 0.6).unwrap();
            assert!(!seen.contains(&current), "{current} visited twice");
            seen.push(current.clone());
        }
        // 绕回起点
        assert_eq!(policy.select_next_model(&current, 0.6).unwrap(), tier.models[0]);
        assert_eq!(seen.len(), tier.models.len());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let policy = RotationPolicy::default();
        let a = policy.select_next_model("claude-3.5-sonnet", 0.55).unwrap();
        let b = policy.select_next_model("claude-3.5-sonnet", 0.55).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "gpt-4o");
    }

    #[test]
    fn test_severe_degradation_downgrades_one_tier() {
        let policy = RotationPolicy::default();
        assert_eq!(
            policy.select_next_model("gpt-4o", 0.3).unwrap(),
            "gemini-2.0-flash"
        );
        assert_eq!(
            policy.select_next_model("claude-3-haiku", 0.3).unwrap(),
            "gemini-1.5-flash"
        );
    }

    #[test]
    fn test_lowest_tier_round_robins_instead_of_downgrading() {
        let policy = RotationPolicy::default();
        assert_eq!(
            policy.select_next_model("gemini-1.5-flash", 0.3).unwrap(),
            "llama-3.3-70b"
        );
        assert_eq!(
            policy.select_next_model("qwen-2.5-72b", 0.1).unwrap(),
            "gemini-1.5-flash"
        );
    }

    #[test]
    fn test_unknown_model_is_an_error() {
        let policy = RotationPolicy::default();
        assert_eq!(
            policy.select_next_model("mystery-model", 0.9),
            Err(EngineError::UnknownModel("mystery-model".into()))
        );
    }

    #[test]
    fn test_decide() {
        let policy = RotationPolicy::default();
        assert_eq!(
            policy.decide("gpt-4o", &score(0.8)).unwrap(),
            RotationDecision::Stay {
                model: "gpt-4o".into()
            }
        );

        let decision = policy.decide("gemini-2.5-pro", &score(0.6)).unwrap();
        assert_eq!(decision.next_model(), "claude-3.5-sonnet");

        let decision = policy.decide("gemini-2.5-pro", &score(0.2)).unwrap();
        assert_eq!(decision.next_model(), "gemini-2.0-flash");
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let tiers = vec![
            ModelTier::new(TierName::Premium, &["a", "b"], 1.0),
            ModelTier::new(TierName::Economy, &["b"], 0.1),
        ];
        assert!(matches!(
            TierTable::new(tiers),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_middle_tier_drops_to_next_configured() {
        let tiers = vec![
            ModelTier::new(TierName::Economy, &["cheap"], 0.1),
            ModelTier::new(TierName::Premium, &["big", "bigger"], 1.0),
        ];
        let table = TierTable::new(tiers).unwrap();
        assert_eq!(table.tiers()[0].name, TierName::Premium);
        let policy = RotationPolicy::new(table, 0.65, 0.5);
        assert_eq!(policy.select_next_model("bigger", 0.1).unwrap(), "cheap");
    }

    #[test]
    fn test_empty_and_duplicate_tiers_rejected() {
        assert!(TierTable::new(vec![]).is_err());
        assert!(TierTable::new(vec![ModelTier::new(TierName::Standard, &[], 0.3)]).is_err());
        assert!(TierTable::new(vec![
            ModelTier::new(TierName::Standard, &["x"], 0.3),
            ModelTier::new(TierName::Standard, &["y"], 0.3),
        ])
        .is_err());
    }
}
