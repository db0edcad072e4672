use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use expenseflow_core::{
    parse_date, AuditEntry, DateRange, ExpenseId, HistoricalOutcome, MatchRecord, RawBankTransaction,
    RawExpense, RecordStatus, TenantId, TransactionId,
};
use thiserror::Error;

use crate::config::RuleOverrides;
use crate::summary::RunSummary;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Storage seen by a reconciliation run. Loads return raw rows; validation
/// happens in the run so malformed rows can be skipped and counted.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Open expenses of `tenant`, optionally restricted to `range`.
    async fn load_expenses(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawExpense>, StoreError>;

    /// Open bank transactions of `tenant`, optionally restricted to `range`.
    async fn load_transactions(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawBankTransaction>, StoreError>;

    /// Most recent reviewed outcomes, newest first, at most `limit`.
    async fn load_history(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<Vec<HistoricalOutcome>, StoreError>;

    async fn load_overrides(&self, tenant: &TenantId) -> Result<Option<RuleOverrides>, StoreError>;

    /// Stores the match, moves both records to the match's status and
    /// appends `audit`, all or nothing.
    async fn persist_match(&self, record: &MatchRecord, audit: &AuditEntry) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError>;
}

/// Rows a run should see: everything not already linked to a match.
/// Unparseable statuses pass so validation can count them.
pub fn is_open_status(status: &str) -> bool {
    !matches!(
        status.parse::<RecordStatus>(),
        Ok(RecordStatus::Matched) | Ok(RecordStatus::PendingReview)
    )
}

/// Unparseable dates pass so validation can count them.
pub fn in_range(date: &str, range: Option<&DateRange>) -> bool {
    match (range, parse_date(date)) {
        (Some(r), Some(d)) => r.contains(d),
        _ => true,
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    expenses: BTreeMap<i64, RawExpense>,
    transactions: BTreeMap<i64, RawBankTransaction>,
    history: BTreeMap<TenantId, Vec<HistoricalOutcome>>,
    overrides: BTreeMap<TenantId, RuleOverrides>,
    matches: Vec<MatchRecord>,
    audit: Vec<AuditEntry>,
    runs: Vec<RunSummary>,
    fail_persist: BTreeSet<ExpenseId>,
    fail_loads: bool,
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_expense(&self, expense: RawExpense) {
        self.state().expenses.insert(expense.id, expense);
    }

    pub fn insert_transaction(&self, tx: RawBankTransaction) {
        self.state().transactions.insert(tx.id, tx);
    }

    pub fn add_history(&self, tenant: &TenantId, outcome: HistoricalOutcome) {
        self.state().history.entry(tenant.clone()).or_default().push(outcome);
    }

    pub fn set_overrides(&self, tenant: &TenantId, overrides: RuleOverrides) {
        self.state().overrides.insert(tenant.clone(), overrides);
    }

    /// Makes every later `persist_match` for `expense` fail.
    pub fn fail_persist_for(&self, expense: ExpenseId) {
        self.state().fail_persist.insert(expense);
    }

    /// Makes record loading fail, or succeed again.
    pub fn set_fail_loads(&self, fail: bool) {
        self.state().fail_loads = fail;
    }

    pub fn matches(&self) -> Vec<MatchRecord> {
        self.state().matches.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.state().audit.clone()
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.state().runs.clone()
    }

    pub fn expense_status(&self, id: ExpenseId) -> Option<String> {
        self.state().expenses.get(&id.0).map(|e| e.status.clone())
    }

    pub fn transaction_status(&self, id: TransactionId) -> Option<String> {
        self.state().transactions.get(&id.0).map(|t| t.status.clone())
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn load_expenses(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawExpense>, StoreError> {
        let state = self.state();
        if state.fail_loads {
            return Err(StoreError::Database("expenses unavailable".into()));
        }
        Ok(state
            .expenses
            .values()
            .filter(|e| e.tenant_id == tenant.0 && is_open_status(&e.status) && in_range(&e.date, range.as_ref()))
            .cloned()
            .collect())
    }

    async fn load_transactions(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawBankTransaction>, StoreError> {
        let state = self.state();
        if state.fail_loads {
            return Err(StoreError::Database("transactions unavailable".into()));
        }
        Ok(state
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant.0 && is_open_status(&t.status) && in_range(&t.date, range.as_ref()))
            .cloned()
            .collect())
    }

    async fn load_history(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<Vec<HistoricalOutcome>, StoreError> {
        let state = self.state();
        let mut history = state.history.get(tenant).cloned().unwrap_or_default();
        history.sort_by(|a, b| b.id.cmp(&a.id));
        history.truncate(limit);
        Ok(history)
    }

    async fn load_overrides(&self, tenant: &TenantId) -> Result<Option<RuleOverrides>, StoreError> {
        Ok(self.state().overrides.get(tenant).cloned())
    }

    async fn persist_match(&self, record: &MatchRecord, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_persist.contains(&record.expense_id) {
            return Err(StoreError::Database(format!(
                "write rejected for expense {}",
                record.expense_id
            )));
        }

        let open = |s: &str| s == RecordStatus::Unmatched.as_str();
        let expense_open = state.expenses.get(&record.expense_id.0).map(|e| open(&e.status));
        let tx_open = state.transactions.get(&record.transaction_id.0).map(|t| open(&t.status));
        match (expense_open, tx_open) {
            (None, _) => return Err(StoreError::NotFound(format!("expense {}", record.expense_id))),
            (_, None) => return Err(StoreError::NotFound(format!("transaction {}", record.transaction_id))),
            (Some(false), _) | (_, Some(false)) => {
                return Err(StoreError::Conflict(format!(
                    "expense {} or transaction {} is already matched",
                    record.expense_id, record.transaction_id
                )))
            }
            (Some(true), Some(true)) => {}
        }

        let status = record.status.record_status().as_str().to_string();
        if let Some(e) = state.expenses.get_mut(&record.expense_id.0) {
            e.status = status.clone();
        }
        if let Some(t) = state.transactions.get_mut(&record.transaction_id.0) {
            t.status = status;
        }
        state.matches.push(record.clone());
        state.audit.push(audit.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.state().audit.push(entry.clone());
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.state().runs.push(summary.clone());
        Ok(())
    }
}
