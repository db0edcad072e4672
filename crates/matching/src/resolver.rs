use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use expenseflow_core::{ExpenseId, MatchProposal, MatchStatus, TransactionId};

use crate::config::{AssignmentMode, MatchConfig};

/// Outcome of one-to-one assignment over a run's proposals.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub auto_confirmed: Vec<MatchProposal>,
    pub pending_review: Vec<MatchProposal>,
    /// Proposals that lost their expense or transaction to another proposal.
    pub rejected: Vec<MatchProposal>,
}

impl Resolution {
    /// Accepted proposals with the status each will be stored under, in
    /// acceptance order.
    pub fn accepted(&self) -> impl Iterator<Item = (&MatchProposal, MatchStatus)> {
        self.auto_confirmed
            .iter()
            .map(|p| (p, MatchStatus::AutoConfirmed))
            .chain(self.pending_review.iter().map(|p| (p, MatchStatus::PendingReview)))
    }

    pub fn accepted_len(&self) -> usize {
        self.auto_confirmed.len() + self.pending_review.len()
    }
}

/// Assigns each expense and each transaction to at most one proposal, then
/// splits the winners into auto-confirmed and pending review.
pub fn resolve(proposals: Vec<MatchProposal>, config: &MatchConfig) -> Resolution {
    let mut proposals = dedup(proposals);
    sort_for_acceptance(&mut proposals);

    let (accepted, rejected) = match config.assignment {
        AssignmentMode::Greedy => greedy(proposals),
        AssignmentMode::Optimal => optimal(proposals),
    };

    let (auto_confirmed, pending_review): (Vec<MatchProposal>, Vec<MatchProposal>) = accepted
        .into_iter()
        .partition(|p| auto_confirm_eligible(p, config));

    Resolution {
        auto_confirmed,
        pending_review,
        rejected,
    }
}

/// Tier exact or high, no warnings and confidence at the auto-confirm
/// threshold.
pub fn auto_confirm_eligible(p: &MatchProposal, config: &MatchConfig) -> bool {
    p.tier.permits_auto_confirm() && p.warnings.is_empty() && p.confidence >= config.auto_confirm_threshold
}

fn dedup(proposals: Vec<MatchProposal>) -> Vec<MatchProposal> {
    let mut unique: BTreeMap<(ExpenseId, TransactionId), MatchProposal> = BTreeMap::new();
    for p in proposals {
        let key = (p.expense_id, p.transaction_id);
        match unique.get(&key) {
            Some(existing) if existing.confidence >= p.confidence => {}
            _ => {
                unique.insert(key, p);
            }
        }
    }
    unique.into_values().collect()
}

/// Descending confidence; ties by expense id, then transaction id.
fn sort_for_acceptance(proposals: &mut [MatchProposal]) {
    proposals.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.expense_id.cmp(&b.expense_id))
            .then(a.transaction_id.cmp(&b.transaction_id))
    });
}

fn greedy(sorted: Vec<MatchProposal>) -> (Vec<MatchProposal>, Vec<MatchProposal>) {
    let mut claimed_expenses: BTreeSet<ExpenseId> = BTreeSet::new();
    let mut claimed_transactions: BTreeSet<TransactionId> = BTreeSet::new();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for p in sorted {
        if claimed_expenses.contains(&p.expense_id) || claimed_transactions.contains(&p.transaction_id) {
            rejected.push(p);
            continue;
        }
        claimed_expenses.insert(p.expense_id);
        claimed_transactions.insert(p.transaction_id);
        accepted.push(p);
    }
    (accepted, rejected)
}

/// Maximum total confidence assignment. Missing pairs cost as much as a
/// zero-confidence proposal and are dropped from the result.
fn optimal(sorted: Vec<MatchProposal>) -> (Vec<MatchProposal>, Vec<MatchProposal>) {
    if sorted.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let expenses: Vec<ExpenseId> = sorted
        .iter()
        .map(|p| p.expense_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let transactions: Vec<TransactionId> = sorted
        .iter()
        .map(|p| p.transaction_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let row_of: BTreeMap<ExpenseId, usize> = expenses.iter().enumerate().map(|(i, e)| (*e, i)).collect();
    let col_of: BTreeMap<TransactionId, usize> =
        transactions.iter().enumerate().map(|(i, t)| (*t, i)).collect();

    let n = expenses.len().max(transactions.len());
    let mut cost = vec![vec![1.0_f64; n]; n];
    let mut at: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for (k, p) in sorted.iter().enumerate() {
        let (r, c) = (row_of[&p.expense_id], col_of[&p.transaction_id]);
        cost[r][c] = 1.0 - p.confidence;
        at.insert((r, c), k);
    }

    let assignment = hungarian(&cost);
    let chosen: BTreeSet<usize> = assignment
        .iter()
        .enumerate()
        .filter_map(|(r, c)| at.get(&(r, *c)).copied())
        .collect();

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for (k, p) in sorted.into_iter().enumerate() {
        if chosen.contains(&k) {
            accepted.push(p);
        } else {
            rejected.push(p);
        }
    }
    (accepted, rejected)
}

/// Minimum-cost perfect assignment on a square matrix (Kuhn-Munkres with
/// potentials, O(n³)). Returns the column assigned to each row.
fn hungarian(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    // p[j]: row (1-based) matched to column j; 0 means free.
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![0usize; n];
    for j in 1..=n {
        if p[j] > 0 {
            row_to_col[p[j] - 1] = j - 1;
        }
    }
    row_to_col
}
