//! 定价与利润拆分
//!
//! 用户价 = max(供应商成本 × 3, $0.01)；毛利中 1/3 进入退款储备金，2/3 为平台净利。
//! 所有金额保留 4 位小数。未知模型按默认模型计价（记 warn 日志），不报错。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::entry::LedgerEntry;
use crate::core::EngineError;
use crate::health::TierName;

pub const DEFAULT_PRICING_MODEL: &str = "gemini-1.5-flash";

/// 单个模型每 1K token 的输入/输出价格（美元）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub name: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    pub fn new(name: &str, input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            name: name.to_string(),
            input_per_1k,
            output_per_1k,
        }
    }

    fn average(&self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

/// 内置价格表（近似值）
pub fn default_model_prices() -> Vec<ModelPrice> {
    vec![
        ModelPrice::new("gemini-2.5-pro", 0.0025, 0.01),
        ModelPrice::new("gemini-2.0-flash", 0.0001, 0.0004),
        ModelPrice::new("gemini-1.5-flash", 0.000075, 0.0003),
        ModelPrice::new("claude-3.5-sonnet", 0.003, 0.015),
        ModelPrice::new("claude-3-haiku", 0.00025, 0.00125),
        ModelPrice::new("gpt-4o", 0.005, 0.015),
        ModelPrice::new("deepseek-r1", 0.00014, 0.00028),
        ModelPrice::new("llama-3.3-70b", 0.00059, 0.00079),
        ModelPrice::new("qwen-2.5-72b", 0.0004, 0.0004),
    ]
}

/// 加价与储备金比例
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub markup_multiplier: f64,
    pub reserve_ratio: f64,
    pub net_profit_ratio: f64,
    pub minimum_charge: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            markup_multiplier: 3.0,
            reserve_ratio: 1.0 / 3.0,
            net_profit_ratio: 2.0 / 3.0,
            minimum_charge: 0.01,
        }
    }
}

impl PricingConfig {
    /// 储备金与净利必须恰好分完毛利
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.markup_multiplier < 1.0 {
            return Err(EngineError::ConfigError(format!(
                "markup_multiplier must be >= 1.0, got {}",
                self.markup_multiplier
            )));
        }
        if self.minimum_charge < 0.0 {
            return Err(EngineError::ConfigError(format!(
                "minimum_charge must be >= 0, got {}",
                self.minimum_charge
            )));
        }
        if self.reserve_ratio < 0.0 || self.net_profit_ratio < 0.0 {
            return Err(EngineError::ConfigError("profit ratios must be >= 0".into()));
        }
        if ((self.reserve_ratio + self.net_profit_ratio) - 1.0).abs() > 1e-9 {
            return Err(EngineError::ConfigError(format!(
                "reserve_ratio + net_profit_ratio must equal 1, got {}",
                self.reserve_ratio + self.net_profit_ratio
            )));
        }
        Ok(())
    }
}

/// 价格表（附默认计价模型）
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    default_price: ModelPrice,
}

impl PriceTable {
    pub fn new(prices: Vec<ModelPrice>, default_model: &str) -> Result<Self, EngineError> {
        let mut map = HashMap::new();
        for price in prices {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(EngineError::ConfigError(format!(
                    "negative price for model {}",
                    price.name
                )));
            }
            if map.contains_key(&price.name) {
                return Err(EngineError::ConfigError(format!(
                    "model {} priced more than once",
                    price.name
                )));
            }
            map.insert(price.name.clone(), price);
        }
        let default_price = map.get(default_model).cloned().ok_or_else(|| {
            EngineError::ConfigError(format!(
                "default pricing model {default_model} has no price row"
            ))
        })?;
        Ok(Self {
            prices: map,
            default_price,
        })
    }

    pub fn get(&self, model: &str) -> Option<&ModelPrice> {
        self.prices.get(model)
    }

    /// 查价；未知模型回退到默认模型
    pub fn price_for(&self, model: &str) -> &ModelPrice {
        if let Some(price) = self.prices.get(model) {
            return price;
        }
        tracing::warn!(
            model,
            fallback = %self.default_price.name,
            "No pricing for model, using default model pricing"
        );
        &self.default_price
    }

    pub fn provider_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.price_for(model);
        (input_tokens as f64 / 1000.0) * price.input_per_1k
            + (output_tokens as f64 / 1000.0) * price.output_per_1k
    }

    /// 按平均单价给出台账上的档位标签；未定价模型为 None（展示为 Unknown）
    pub fn tier_label(&self, model: &str) -> Option<TierName> {
        let avg = self.prices.get(model)?.average();
        Some(if avg >= 0.005 {
            TierName::Premium
        } else if avg >= 0.0005 {
            TierName::Standard
        } else {
            TierName::Economy
        })
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: default_model_prices()
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            default_price: ModelPrice::new(DEFAULT_PRICING_MODEL, 0.000075, 0.0003),
        }
    }
}

/// 单个任务的利润拆分
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitBreakdown {
    pub provider_cost: f64,
    pub user_billed_price: f64,
    pub gross_profit: f64,
    pub reserve_amount: f64,
    pub net_profit: f64,
}

/// 成本核算：价格表 + 加价配置
#[derive(Debug, Clone, Default)]
pub struct CostLedger {
    prices: PriceTable,
    pricing: PricingConfig,
}

impl CostLedger {
    pub fn new(prices: PriceTable, pricing: PricingConfig) -> Result<Self, EngineError> {
        pricing.validate()?;
        Ok(Self { prices, pricing })
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    pub fn calculate_provider_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.prices.provider_cost(model, input_tokens, output_tokens)
    }

    pub fn calculate_profit_breakdown(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> ProfitBreakdown {
        let provider_cost = self.calculate_provider_cost(model, input_tokens, output_tokens);
        let user_billed_price =
            (provider_cost * self.pricing.markup_multiplier).max(self.pricing.minimum_charge);
        let gross_profit = user_billed_price - provider_cost;

        // 储备金与净利都按未舍入的毛利乘比例，各自舍入（两者之和与毛利相差不超过 1e-4）
        ProfitBreakdown {
            provider_cost: round4(provider_cost),
            user_billed_price: round4(user_billed_price),
            gross_profit: round4(gross_profit),
            reserve_amount: round4(gross_profit * self.pricing.reserve_ratio),
            net_profit: round4(gross_profit * self.pricing.net_profit_ratio),
        }
    }

    /// 为已结束（成功或失败）的任务生成台账记录
    pub fn create_ledger_entry(
        &self,
        task_id: &str,
        user_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        success: bool,
    ) -> LedgerEntry {
        let breakdown = self.calculate_profit_breakdown(model, input_tokens, output_tokens);
        LedgerEntry {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            model_tier: self.prices.tier_label(model),
            provider_cost: breakdown.provider_cost,
            user_billed_price: breakdown.user_billed_price,
            gross_profit: breakdown.gross_profit,
            reserve_amount: breakdown.reserve_amount,
            net_profit: breakdown.net_profit,
            success,
            refunded: false,
            refund_reason: None,
            created_at: chrono::Utc::now(),
        }
    }
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
