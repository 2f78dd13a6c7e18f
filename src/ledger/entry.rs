//! 台账记录与退款规则
//!
//! LedgerEntry 创建后只有 refunded / refund_reason 会被改写，且 refunded 单调变为 true。
//! 储备金余额 = 所有未退款记录的 reserve_amount 之和；已退款记录的储备金视为已消耗，
//! 不另记借方流水。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pricing::round4;
use crate::health::TierName;

/// 单个任务的财务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task_id: String,
    pub user_id: String,
    pub model: String,
    /// 按单价推断的档位；未定价模型为 None
    pub model_tier: Option<TierName>,
    pub provider_cost: f64,
    pub user_billed_price: f64,
    pub gross_profit: f64,
    pub reserve_amount: f64,
    pub net_profit: f64,
    pub success: bool,
    pub refunded: bool,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn tier_label(&self) -> &'static str {
        self.model_tier.map(|t| t.as_str()).unwrap_or("Unknown")
    }
}

/// 不可退款的原因
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RefundIneligibility {
    /// 任务成功，不在保障范围内
    Succeeded,
    AlreadyRefunded,
    /// 用户储备金不足以覆盖该记录的储备额
    InsufficientReserve { balance: f64, required: f64 },
}

impl std::fmt::Display for RefundIneligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefundIneligibility::Succeeded => write!(f, "task succeeded"),
            RefundIneligibility::AlreadyRefunded => write!(f, "already refunded"),
            RefundIneligibility::InsufficientReserve { balance, required } => write!(
                f,
                "reserve balance {balance:.4} below required {required:.4}"
            ),
        }
    }
}

/// 逐项检查退款前置条件，给出第一个不满足的原因
pub fn check_refund(entry: &LedgerEntry, user_reserve_balance: f64) -> Result<(), RefundIneligibility> {
    if entry.success {
        return Err(RefundIneligibility::Succeeded);
    }
    if entry.refunded {
        return Err(RefundIneligibility::AlreadyRefunded);
    }
    if user_reserve_balance < entry.reserve_amount {
        return Err(RefundIneligibility::InsufficientReserve {
            balance: user_reserve_balance,
            required: entry.reserve_amount,
        });
    }
    Ok(())
}

/// 失败、未退款、且储备金足够时可退款
pub fn is_refund_eligible(entry: &LedgerEntry, user_reserve_balance: f64) -> bool {
    check_refund(entry, user_reserve_balance).is_ok()
}

/// 标记退款（只是记账标记，实际转账由外部支付方完成）；重复调用只会覆盖 reason
pub fn process_refund(entry: LedgerEntry, reason: impl Into<String>) -> LedgerEntry {
    LedgerEntry {
        refunded: true,
        refund_reason: Some(reason.into()),
        ..entry
    }
}

/// 用户储备金余额：未退款记录的 reserve_amount 之和
pub fn calculate_reserve_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> f64 {
    let total: f64 = entries
        .into_iter()
        .filter(|e| !e.refunded)
        .map(|e| e.reserve_amount)
        .sum();
    round4(total)
}
