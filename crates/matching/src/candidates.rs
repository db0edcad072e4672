use std::cmp::Ordering;

use expenseflow_core::{days_apart, BankTransaction, ExpenseRecord, RecordStatus};

use crate::config::MatchConfig;
use crate::currency::CurrencyNormalizer;
use crate::similarity::relative_difference;

/// A transaction that survived the cheap pre-filters for one expense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Position of the transaction in the run's transaction pool.
    pub index: usize,
    /// Transaction magnitude in the reporting currency.
    pub amount: f64,
    pub amount_variance: f64,
    pub date_gap_days: i64,
}

/// Selects the transactions worth scoring against `expense`: open debits of
/// the same tenant, close enough in date and in reporting-currency amount.
///
/// Returns an empty list when the expense itself cannot be converted.
pub fn generate_candidates(
    expense: &ExpenseRecord,
    pool: &[BankTransaction],
    normalizer: &CurrencyNormalizer,
    config: &MatchConfig,
) -> Vec<Candidate> {
    let Some(expense_amount) = normalizer.magnitude(&expense.amount) else {
        return Vec::new();
    };

    let mut candidates: Vec<Candidate> = pool
        .iter()
        .enumerate()
        .filter(|(_, tx)| {
            tx.tenant_id == expense.tenant_id
                && tx.status == RecordStatus::Unmatched
                && tx.is_debit()
        })
        .filter_map(|(index, tx)| {
            let date_gap_days = days_apart(expense.date, tx.date);
            if date_gap_days > config.candidate_date_window_days {
                return None;
            }
            let amount = normalizer.magnitude(&tx.amount)?;
            let amount_variance = relative_difference(expense_amount, amount);
            if amount_variance > config.candidate_amount_tolerance {
                return None;
            }
            Some(Candidate {
                index,
                amount,
                amount_variance,
                date_gap_days,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.amount_variance
            .partial_cmp(&b.amount_variance)
            .unwrap_or(Ordering::Equal)
            .then(a.date_gap_days.cmp(&b.date_gap_days))
            .then(pool[a.index].id.cmp(&pool[b.index].id))
    });
    candidates.truncate(config.max_candidates_per_expense);
    candidates
}
