use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use expenseflow_core::{MatchRecord, MatchStatus, TenantId, Warning};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Statistics of one run. Counts describe what was durably committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub tenant_id: TenantId,
    pub started_at: DateTime<Utc>,
    pub expenses_considered: usize,
    pub transactions_considered: usize,
    pub skipped_records: usize,
    /// Expenses in a currency with no usable exchange rate.
    pub unconvertible_expenses: usize,
    pub candidates_considered: usize,
    pub proposals_generated: usize,
    pub proposals_vetoed: usize,
    pub conflicts_rejected: usize,
    pub matches_found: usize,
    pub auto_confirmed: usize,
    pub pending_review: usize,
    pub persist_failures: usize,
    pub warnings: BTreeMap<Warning, usize>,
    pub recommendations: Vec<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, tenant_id: TenantId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            tenant_id,
            started_at,
            expenses_considered: 0,
            transactions_considered: 0,
            skipped_records: 0,
            unconvertible_expenses: 0,
            candidates_considered: 0,
            proposals_generated: 0,
            proposals_vetoed: 0,
            conflicts_rejected: 0,
            matches_found: 0,
            auto_confirmed: 0,
            pending_review: 0,
            persist_failures: 0,
            warnings: BTreeMap::new(),
            recommendations: Vec::new(),
        }
    }

    /// Counts one committed match.
    pub fn record_match(&mut self, record: &MatchRecord) {
        self.matches_found += 1;
        match record.status {
            MatchStatus::AutoConfirmed | MatchStatus::Confirmed => self.auto_confirmed += 1,
            MatchStatus::PendingReview => self.pending_review += 1,
            MatchStatus::Rejected => {}
        }
        for w in &record.warnings {
            *self.warnings.entry(*w).or_default() += 1;
        }
    }

    /// Share of considered expenses that ended up matched.
    pub fn match_rate(&self) -> f64 {
        if self.expenses_considered == 0 {
            0.0
        } else {
            self.matches_found as f64 / self.expenses_considered as f64
        }
    }

    pub fn auto_confirm_rate(&self) -> f64 {
        if self.matches_found == 0 {
            0.0
        } else {
            self.auto_confirmed as f64 / self.matches_found as f64
        }
    }

    fn warning_count(&self, w: Warning) -> usize {
        self.warnings.get(&w).copied().unwrap_or(0)
    }

    /// Derives the human-facing follow-ups from the final counts.
    pub fn finalize(&mut self) {
        let mut out = Vec::new();
        let total_warnings: usize = self.warnings.values().sum();
        let currency = self.warning_count(Warning::CurrencyConversion)
            + self.warning_count(Warning::FallbackExchangeRate);

        if self.warning_count(Warning::FallbackExchangeRate) > 0
            || (total_warnings > 0 && currency * 2 > total_warnings)
        {
            out.push("Update exchange rates: currency conversion warnings dominate this run".to_string());
        }
        if self.unconvertible_expenses > 0 {
            out.push(format!(
                "Provide exchange rates for {} expense(s) in unsupported currencies",
                self.unconvertible_expenses
            ));
        }
        if self.warning_count(Warning::HighAmountVariance) > 0 {
            out.push("Review amount discrepancies on matches with high variance".to_string());
        }
        if self.expenses_considered > 0 && self.match_rate() < 0.5 {
            out.push("Low match rate: check that bank statements cover the expense period".to_string());
        }
        if self.pending_review > self.auto_confirmed {
            out.push(format!("Clear the review queue: {} match(es) pending", self.pending_review));
        }
        if self.persist_failures > 0 {
            out.push(format!(
                "Check storage health: {} match(es) could not be saved",
                self.persist_failures
            ));
        }
        if self.skipped_records > 0 {
            out.push(format!("Fix {} malformed record(s) skipped by this run", self.skipped_records));
        }
        self.recommendations = out;
    }
}

/// What a run returns to its caller, whether or not it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub success: bool,
    pub failure_reason: Option<String>,
    pub summary: RunSummary,
    pub matches: Vec<MatchRecord>,
    pub processing_time_ms: u64,
}
