//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TAGTEAM__*` 覆盖（双下划线表示嵌套，如 `TAGTEAM__DISPATCH__MAX_CONCURRENT_TASKS=2`）。
//! 这里只做反序列化；档位唯一性、比例之和等约束在转换为运行时结构时校验。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::EngineError;
use crate::dispatch::{
    DelegationPolicy, DispatchConfig, DEFAULT_DELEGATION_COST_THRESHOLD,
    DEFAULT_DELEGATION_TIME_THRESHOLD_SECS, DEFAULT_MAX_CONCURRENT_TASKS,
    DEFAULT_SECONDARY_EXECUTOR, DEFAULT_TASK_TIMEOUT_SECS,
};
use crate::health::{
    default_model_tiers, ModelTier, RotationPolicy, TierTable, DEFAULT_SEVERE_DEGRADATION_LEVEL,
    DEFAULT_TAP_OUT_THRESHOLD,
};
use crate::ledger::{
    default_model_prices, CostLedger, ModelPrice, PriceTable, PricingConfig, DEFAULT_PRICING_MODEL,
};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub rotation: RotationSection,
    pub pricing: PricingSection,
    pub dispatch: DispatchSection,
}

/// [rotation] 段：交棒阈值、严重退化线、初始模型、档位表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationSection {
    pub tap_out_threshold: f64,
    pub severe_degradation_level: f64,
    /// 能力没有首选模型时的起始模型
    pub initial_model: String,
    /// 按 [[rotation.tiers]] 声明
    pub tiers: Vec<ModelTier>,
}

impl Default for RotationSection {
    fn default() -> Self {
        Self {
            tap_out_threshold: DEFAULT_TAP_OUT_THRESHOLD,
            severe_degradation_level: DEFAULT_SEVERE_DEGRADATION_LEVEL,
            initial_model: "gemini-2.5-pro".to_string(),
            tiers: default_model_tiers(),
        }
    }
}

impl RotationSection {
    pub fn policy(&self) -> Result<RotationPolicy, EngineError> {
        if !(0.0..=1.0).contains(&self.tap_out_threshold)
            || !(0.0..=1.0).contains(&self.severe_degradation_level)
        {
            return Err(EngineError::ConfigError(
                "rotation thresholds must be within [0, 1]".into(),
            ));
        }
        let tiers = TierTable::new(self.tiers.clone())?;
        if !tiers.contains(&self.initial_model) {
            return Err(EngineError::ConfigError(format!(
                "initial_model {} is not in any tier",
                self.initial_model
            )));
        }
        Ok(RotationPolicy::new(
            tiers,
            self.tap_out_threshold,
            self.severe_degradation_level,
        ))
    }
}

/// [pricing] 段：加价倍数、利润拆分比例、最低收费、价格表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingSection {
    pub markup_multiplier: f64,
    pub reserve_ratio: f64,
    pub net_profit_ratio: f64,
    pub minimum_charge: f64,
    /// 价格表中找不到模型时按该模型计价
    pub default_model: String,
    /// 按 [[pricing.models]] 声明
    pub models: Vec<ModelPrice>,
}

impl Default for PricingSection {
    fn default() -> Self {
        let pricing = PricingConfig::default();
        Self {
            markup_multiplier: pricing.markup_multiplier,
            reserve_ratio: pricing.reserve_ratio,
            net_profit_ratio: pricing.net_profit_ratio,
            minimum_charge: pricing.minimum_charge,
            default_model: DEFAULT_PRICING_MODEL.to_string(),
            models: default_model_prices(),
        }
    }
}

impl PricingSection {
    pub fn pricing_config(&self) -> PricingConfig {
        PricingConfig {
            markup_multiplier: self.markup_multiplier,
            reserve_ratio: self.reserve_ratio,
            net_profit_ratio: self.net_profit_ratio,
            minimum_charge: self.minimum_charge,
        }
    }

    pub fn cost_ledger(&self) -> Result<CostLedger, EngineError> {
        let prices = PriceTable::new(self.models.clone(), &self.default_model)?;
        CostLedger::new(prices, self.pricing_config())
    }
}

/// [dispatch] 段：并发上限、委派阈值、任务超时、默认次级执行者
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub max_concurrent_tasks: usize,
    pub delegation_cost_threshold: f64,
    pub delegation_time_threshold_secs: u64,
    pub task_timeout_secs: u64,
    pub secondary_executor: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            delegation_cost_threshold: DEFAULT_DELEGATION_COST_THRESHOLD,
            delegation_time_threshold_secs: DEFAULT_DELEGATION_TIME_THRESHOLD_SECS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            secondary_executor: DEFAULT_SECONDARY_EXECUTOR.to_string(),
        }
    }
}

impl DispatchSection {
    pub fn dispatch_config(&self) -> Result<DispatchConfig, EngineError> {
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::ConfigError(
                "max_concurrent_tasks must be positive".into(),
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "task_timeout_secs must be positive".into(),
            ));
        }
        Ok(DispatchConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            delegation: DelegationPolicy {
                cost_threshold: self.delegation_cost_threshold,
                time_threshold_secs: self.delegation_time_threshold_secs,
            },
            task_timeout: Duration::from_secs(self.task_timeout_secs),
        })
    }
}

/// 从 config 目录加载配置，环境变量 TAGTEAM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TAGTEAM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TAGTEAM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否据此重建引擎）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
