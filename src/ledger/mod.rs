//! 台账层：定价、利润拆分、退款储备金与退款处理

pub mod book;
pub mod entry;
pub mod pricing;

pub use book::{
    BookkeepingOnly, LedgerBook, LedgerSummary, PaymentProcessor, RefundOutcome, RefundRequest,
    DEFAULT_PAYMENT_TIMEOUT_SECS,
};
pub use entry::{
    calculate_reserve_balance, check_refund, is_refund_eligible, process_refund, LedgerEntry,
    RefundIneligibility,
};
pub use pricing::{
    default_model_prices, CostLedger, ModelPrice, PriceTable, PricingConfig, ProfitBreakdown,
    DEFAULT_PRICING_MODEL,
};
