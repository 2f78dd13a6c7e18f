//! 台账簿：按任务追加、按用户聚合，并串行化退款
//!
//! 退款的「检查资格 -> 外部转账 -> 写 refunded」在同一把锁内完成，
//! 余额在检查与写入之间不会被其他退款改变。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::entry::{calculate_reserve_balance, check_refund, process_refund, LedgerEntry, RefundIneligibility};
use super::pricing::round4;
use crate::core::EngineError;

/// 交给外部支付方的退款请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub task_id: String,
    pub user_id: String,
    /// 退还给用户的金额（即当次计费）
    pub amount: f64,
    /// 该记录占用的储备金
    pub reserve_amount: f64,
    pub reason: String,
}

/// 外部支付协作方：执行实际转账并回报结果
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn refund(&self, request: &RefundRequest) -> Result<(), String>;
}

/// 只记账、不转账的支付方（本地运行与测试用）
#[derive(Debug, Default)]
pub struct BookkeepingOnly;

#[async_trait]
impl PaymentProcessor for BookkeepingOnly {
    async fn refund(&self, request: &RefundRequest) -> Result<(), String> {
        tracing::debug!(task_id = %request.task_id, amount = request.amount, "bookkeeping-only refund");
        Ok(())
    }
}

/// 退款处理结果；不可退款是常规结果而非错误
#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    Refunded(LedgerEntry),
    Ineligible(RefundIneligibility),
    /// 支付方拒绝，记录保持未退款
    PaymentDeclined(String),
}

/// 用户维度的财务汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub task_count: usize,
    pub failed_count: usize,
    pub refunded_count: usize,
    pub total_billed: f64,
    pub total_provider_cost: f64,
    pub total_net_profit: f64,
    pub reserve_balance: f64,
}

#[derive(Default)]
struct BookState {
    entries: Vec<LedgerEntry>,
    by_task: HashMap<String, usize>,
    by_user: HashMap<String, Vec<usize>>,
}

impl BookState {
    fn user_entries<'a>(&'a self, user_id: &str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.by_user
            .get(user_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&i| &self.entries[i])
    }
}

pub const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 30;

/// 内存台账簿（持久化由外部存储协作方负责）
pub struct LedgerBook {
    state: Mutex<BookState>,
    /// 退款期间持锁等待支付方的上限
    payment_timeout: Duration,
}

impl Default for LedgerBook {
    fn default() -> Self {
        Self::with_payment_timeout(Duration::from_secs(DEFAULT_PAYMENT_TIMEOUT_SECS))
    }
}

impl LedgerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payment_timeout(payment_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BookState::default()),
            payment_timeout,
        }
    }

    /// 追加一条记录；同一任务只能记一次
    pub async fn record(&self, entry: LedgerEntry) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.by_task.contains_key(&entry.task_id) {
            return Err(EngineError::DuplicateLedgerEntry(entry.task_id));
        }
        let index = state.entries.len();
        state.by_task.insert(entry.task_id.clone(), index);
        state
            .by_user
            .entry(entry.user_id.clone())
            .or_default()
            .push(index);
        tracing::info!(
            task_id = %entry.task_id,
            user_id = %entry.user_id,
            billed = entry.user_billed_price,
            reserve = entry.reserve_amount,
            success = entry.success,
            "Ledger entry recorded"
        );
        state.entries.push(entry);
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Option<LedgerEntry> {
        let state = self.state.lock().await;
        state.by_task.get(task_id).map(|&i| state.entries[i].clone())
    }

    pub async fn entries_for_user(&self, user_id: &str) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state.user_entries(user_id).cloned().collect()
    }

    pub async fn reserve_balance(&self, user_id: &str) -> f64 {
        let state = self.state.lock().await;
        calculate_reserve_balance(state.user_entries(user_id))
    }

    pub async fn summary(&self, user_id: &str) -> LedgerSummary {
        let state = self.state.lock().await;
        let mut summary = LedgerSummary::default();
        for entry in state.user_entries(user_id) {
            summary.task_count += 1;
            if !entry.success {
                summary.failed_count += 1;
            }
            if entry.refunded {
                summary.refunded_count += 1;
            }
            summary.total_billed += entry.user_billed_price;
            summary.total_provider_cost += entry.provider_cost;
            summary.total_net_profit += entry.net_profit;
        }
        summary.total_billed = round4(summary.total_billed);
        summary.total_provider_cost = round4(summary.total_provider_cost);
        summary.total_net_profit = round4(summary.total_net_profit);
        summary.reserve_balance = calculate_reserve_balance(state.user_entries(user_id));
        summary
    }

    /// 校验资格、调用支付方、写退款标记，全程持锁
    pub async fn refund(
        &self,
        task_id: &str,
        reason: &str,
        payments: &dyn PaymentProcessor,
    ) -> Result<RefundOutcome, EngineError> {
        let mut state = self.state.lock().await;
        let index = *state
            .by_task
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let entry = state.entries[index].clone();
        let balance = calculate_reserve_balance(state.user_entries(&entry.user_id));

        if let Err(why) = check_refund(&entry, balance) {
            tracing::info!(task_id, reason = %why, "Refund not eligible");
            return Ok(RefundOutcome::Ineligible(why));
        }

        let request = RefundRequest {
            task_id: entry.task_id.clone(),
            user_id: entry.user_id.clone(),
            amount: entry.user_billed_price,
            reserve_amount: entry.reserve_amount,
            reason: reason.to_string(),
        };
        match tokio::time::timeout(self.payment_timeout, payments.refund(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(task_id, error = %e, "Payment processor declined refund");
                return Ok(RefundOutcome::PaymentDeclined(e));
            }
            Err(_) => {
                let reason = format!(
                    "payment processor timed out after {:?}",
                    self.payment_timeout
                );
                tracing::warn!(task_id, "{reason}");
                return Ok(RefundOutcome::PaymentDeclined(reason));
            }
        }

        let updated = process_refund(entry, reason);
        state.entries[index] = updated.clone();
        tracing::info!(
            task_id,
            user_id = %updated.user_id,
            amount = updated.user_billed_price,
            "Refund processed"
        );
        Ok(RefundOutcome::Refunded(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CostLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Declining;

    #[async_trait]
    impl PaymentProcessor for Declining {
        async fn refund(&self, _request: &RefundRequest) -> Result<(), String> {
            Err("card expired".to_string())
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentProcessor for Counting {
        async fn refund(&self, _request: &RefundRequest) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_record_rejects_duplicates() {
        let ledger = CostLedger::default();
        let book = LedgerBook::new();
        let entry = ledger.create_ledger_entry("t1", "u1", "gpt-4o", 1_000, 1_000, true);
        book.record(entry.clone()).await.unwrap();
        assert_eq!(
            book.record(entry).await,
            Err(EngineError::DuplicateLedgerEntry("t1".into()))
        );
    }

    #[tokio::test]
    async fn test_refund_failed_task_once() {
        let ledger = CostLedger::default();
        let book = LedgerBook::new();
        let payments = Counting::default();
        book.record(ledger.create_ledger_entry("t1", "u1", "gpt-4o", 10_000, 2_000, false))
            .await
            .unwrap();

        let before = book.reserve_balance("u1").await;
        assert!((before - 0.0533).abs() < 1e-9);

        let outcome = book.refund("t1", "hallucinated citations", &payments).await.unwrap();
        match outcome {
            RefundOutcome::Refunded(entry) => {
                assert!(entry.refunded);
                assert_eq!(entry.refund_reason.as_deref(), Some("hallucinated citations"));
            }
            other => panic!("expected refund, got {other:?}"),
        }
        assert_eq!(book.reserve_balance("u1").await, 0.0);

        let again = book.refund("t1", "retry", &payments).await.unwrap();
        assert_eq!(
            again,
            RefundOutcome::Ineligible(RefundIneligibility::AlreadyRefunded)
        );
        assert_eq!(payments.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_declined_payment_leaves_entry_unrefunded() {
        let ledger = CostLedger::default();
        let book = LedgerBook::new();
        book.record(ledger.create_ledger_entry("t1", "u1", "gpt-4o", 1_000, 1_000, false))
            .await
            .unwrap();
        let outcome = book.refund("t1", "timeout", &Declining).await.unwrap();
        assert_eq!(outcome, RefundOutcome::PaymentDeclined("card expired".into()));
        assert!(!book.get("t1").await.unwrap().refunded);
    }

    struct Unresponsive;

    #[async_trait]
    impl PaymentProcessor for Unresponsive {
        async fn refund(&self, _request: &RefundRequest) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_payment_times_out_and_releases_book() {
        let ledger = CostLedger::default();
        let book = LedgerBook::with_payment_timeout(Duration::from_millis(50));
        book.record(ledger.create_ledger_entry("t1", "u1", "gpt-4o", 1_000, 1_000, false))
            .await
            .unwrap();

        let outcome = book.refund("t1", "timeout", &Unresponsive).await.unwrap();
        assert_eq!(
            outcome,
            RefundOutcome::PaymentDeclined("payment processor timed out after 50ms".into())
        );
        assert!(!book.get("t1").await.unwrap().refunded);

        // 锁已释放，后续退款照常进行
        let retry = book.refund("t1", "timeout", &BookkeepingOnly).await.unwrap();
        assert!(matches!(retry, RefundOutcome::Refunded(_)));
    }

    #[tokio::test]
    async fn test_unknown_task_refund() {
        let book = LedgerBook::new();
        assert!(matches!(
            book.refund("nope", "x", &BookkeepingOnly).await,
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refunds_serialize() {
        let ledger = CostLedger::default();
        let book = Arc::new(LedgerBook::new());
        book.record(ledger.create_ledger_entry("ok", "u1", "gpt-4o", 1_000, 1_000, true))
            .await
            .unwrap();
        book.record(ledger.create_ledger_entry("f1", "u1", "gpt-4o", 10_000, 2_000, false))
            .await
            .unwrap();
        book.record(ledger.create_ledger_entry("f2", "u1", "gpt-4o", 10_000, 2_000, false))
            .await
            .unwrap();

        let payments = Arc::new(Counting::default());
        let mut handles = Vec::new();
        for id in ["f1", "f2"] {
            let book = Arc::clone(&book);
            let payments = Arc::clone(&payments);
            handles.push(tokio::spawn(async move {
                book.refund(id, "failed", payments.as_ref()).await.unwrap()
            }));
        }
        let mut refunded = 0;
        for h in handles {
            if matches!(h.await.unwrap(), RefundOutcome::Refunded(_)) {
                refunded += 1;
            }
        }
        assert_eq!(refunded, 2);
        assert_eq!(payments.calls.load(Ordering::SeqCst), 2);
        // 只剩成功记录的储备金
        assert!((book.reserve_balance("u1").await - 0.0133).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_summary() {
        let ledger = CostLedger::default();
        let book = LedgerBook::new();
        book.record(ledger.create_ledger_entry("t1", "u1", "gpt-4o", 10_000, 2_000, true))
            .await
            .unwrap();
        book.record(ledger.create_ledger_entry("t2", "u1", "gpt-4o", 10_000, 2_000, false))
            .await
            .unwrap();
        book.record(ledger.create_ledger_entry("t3", "u2", "gpt-4o", 10_000, 2_000, false))
            .await
            .unwrap();
        book.refund("t2", "bad", &BookkeepingOnly).await.unwrap();

        let summary = book.summary("u1").await;
        assert_eq!(summary.task_count, 2);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.refunded_count, 1);
        assert!((summary.total_billed - 0.48).abs() < 1e-9);
        assert!((summary.reserve_balance - 0.0533).abs() < 1e-9);
        assert_eq!(book.entries_for_user("u2").await.len(), 1);
    }
}
