use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::record::{ExpenseId, RecordStatus, TenantId, TransactionId};

/// Per-dimension similarity, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub amount: f64,
    pub date: f64,
    pub merchant: f64,
    pub keyword: f64,
    pub currency: f64,
}

impl ComponentScores {
    pub fn clamped(self) -> Self {
        ComponentScores {
            amount: clamp_unit(self.amount),
            date: clamp_unit(self.date),
            merchant: clamp_unit(self.merchant),
            keyword: clamp_unit(self.keyword),
            currency: clamp_unit(self.currency),
        }
    }
}

/// Clamps into [0, 1], mapping NaN to 0.
pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Exact,
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            ConfidenceTier::Exact
        } else if score >= 0.7 {
            ConfidenceTier::High
        } else if score >= 0.5 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    pub fn permits_auto_confirm(self) -> bool {
        matches!(self, ConfidenceTier::Exact | ConfidenceTier::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceTier::Exact => "exact",
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfidenceTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(ConfidenceTier::Exact),
            "high" => Ok(ConfidenceTier::High),
            "medium" => Ok(ConfidenceTier::Medium),
            "low" => Ok(ConfidenceTier::Low),
            other => Err(format!("Unknown confidence tier: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    AutoConfirmed,
    PendingReview,
    /// Accepted by a reviewer after sitting in the review queue.
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::AutoConfirmed => "auto_confirmed",
            MatchStatus::PendingReview => "pending_review",
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Rejected => "rejected",
        }
    }

    /// Status the linked expense and transaction take while this match is active.
    pub fn record_status(self) -> RecordStatus {
        match self {
            MatchStatus::AutoConfirmed | MatchStatus::Confirmed => RecordStatus::Matched,
            MatchStatus::PendingReview => RecordStatus::PendingReview,
            MatchStatus::Rejected => RecordStatus::Unmatched,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_confirmed" => Ok(MatchStatus::AutoConfirmed),
            "pending_review" => Ok(MatchStatus::PendingReview),
            "confirmed" => Ok(MatchStatus::Confirmed),
            "rejected" => Ok(MatchStatus::Rejected),
            other => Err(format!("Unknown match status: '{other}'")),
        }
    }
}

/// Caution tags that block auto-confirmation without vetoing the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    HighAmountVariance,
    LargeDateGap,
    CurrencyConversion,
    FallbackExchangeRate,
}

impl Warning {
    pub fn as_str(self) -> &'static str {
        match self {
            Warning::HighAmountVariance => "high_amount_variance",
            Warning::LargeDateGap => "large_date_gap",
            Warning::CurrencyConversion => "currency_conversion",
            Warning::FallbackExchangeRate => "fallback_exchange_rate",
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Warning {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_amount_variance" => Ok(Warning::HighAmountVariance),
            "large_date_gap" => Ok(Warning::LargeDateGap),
            "currency_conversion" => Ok(Warning::CurrencyConversion),
            "fallback_exchange_rate" => Ok(Warning::FallbackExchangeRate),
            other => Err(format!("Unknown warning: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Exact,
    Fuzzy,
    Pattern,
    Learned,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Exact => "exact",
            StrategyKind::Fuzzy => "fuzzy",
            StrategyKind::Pattern => "pattern",
            StrategyKind::Learned => "learned",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(StrategyKind::Exact),
            "fuzzy" => Ok(StrategyKind::Fuzzy),
            "pattern" => Ok(StrategyKind::Pattern),
            "learned" => Ok(StrategyKind::Learned),
            other => Err(format!("Unknown strategy: '{other}'")),
        }
    }
}

pub const FEATURE_COUNT: usize = 10;

/// Inputs to the nearest-neighbour predictor: the five component scores, both
/// amounts in the reporting currency, the day gap and the two text lengths.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn new(
        scores: &ComponentScores,
        expense_amount: f64,
        transaction_amount: f64,
        date_gap_days: i64,
        merchant_len: usize,
        description_len: usize,
    ) -> Self {
        FeatureVector([
            scores.amount,
            scores.date,
            scores.merchant,
            scores.keyword,
            scores.currency,
            expense_amount,
            transaction_amount,
            date_gap_days as f64,
            merchant_len as f64,
            description_len as f64,
        ])
    }

    pub fn distance(&self, other: &FeatureVector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

/// A reviewed match kept as training data for the learned strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOutcome {
    pub id: i64,
    pub features: FeatureVector,
    pub confirmed: bool,
}

/// Ephemeral scored pairing produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchProposal {
    pub expense_id: ExpenseId,
    pub transaction_id: TransactionId,
    pub scores: ComponentScores,
    pub confidence: f64,
    pub tier: ConfidenceTier,
    pub strategy: StrategyKind,
    pub warnings: BTreeSet<Warning>,
    /// Relative amount difference in the reporting currency.
    pub amount_variance: f64,
    pub date_gap_days: i64,
    pub cross_currency: bool,
    /// At least one side was converted with a fallback exchange rate.
    pub fallback_rate: bool,
    pub features: FeatureVector,
}

impl MatchProposal {
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_unit(confidence);
        self.tier = ConfidenceTier::from_score(self.confidence);
    }
}

/// Durable form of an accepted proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: TenantId,
    pub expense_id: ExpenseId,
    pub transaction_id: TransactionId,
    pub scores: ComponentScores,
    pub confidence: f64,
    pub tier: ConfidenceTier,
    pub status: MatchStatus,
    pub strategy: StrategyKind,
    pub warnings: Vec<Warning>,
    pub features: FeatureVector,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn from_proposal(
        proposal: &MatchProposal,
        status: MatchStatus,
        tenant_id: TenantId,
        run_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        MatchRecord {
            id: Uuid::new_v4(),
            run_id,
            tenant_id,
            expense_id: proposal.expense_id,
            transaction_id: proposal.transaction_id,
            scores: proposal.scores,
            confidence: proposal.confidence,
            tier: proposal.tier,
            status,
            strategy: proposal.strategy,
            warnings: proposal.warnings.iter().copied().collect(),
            features: proposal.features,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MatchCreated,
    ProposalRejected,
    MatchConfirmed,
    MatchRejected,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::MatchCreated => "match_created",
            AuditAction::ProposalRejected => "proposal_rejected",
            AuditAction::MatchConfirmed => "match_confirmed",
            AuditAction::MatchRejected => "match_rejected",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit stream: what happened to which pair, with the
/// status transition and the full score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: Option<Uuid>,
    pub tenant_id: TenantId,
    pub action: AuditAction,
    pub match_id: Option<Uuid>,
    pub expense_id: ExpenseId,
    pub transaction_id: TransactionId,
    pub status_before: RecordStatus,
    pub status_after: RecordStatus,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry for a match written by a reconciliation run.
    pub fn for_created_match(record: &MatchRecord) -> Self {
        AuditEntry {
            run_id: Some(record.run_id),
            tenant_id: record.tenant_id.clone(),
            action: AuditAction::MatchCreated,
            match_id: Some(record.id),
            expense_id: record.expense_id,
            transaction_id: record.transaction_id,
            status_before: RecordStatus::Unmatched,
            status_after: record.status.record_status(),
            details: serde_json::json!({
                "strategy": record.strategy,
                "confidence": record.confidence,
                "tier": record.tier,
                "status": record.status,
                "scores": record.scores,
                "warnings": record.warnings,
            }),
            created_at: record.created_at,
        }
    }

    /// Entry for a proposal that lost conflict resolution to a stronger one.
    pub fn for_rejected_proposal(
        proposal: &MatchProposal,
        tenant_id: TenantId,
        run_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        AuditEntry {
            run_id: Some(run_id),
            tenant_id,
            action: AuditAction::ProposalRejected,
            match_id: None,
            expense_id: proposal.expense_id,
            transaction_id: proposal.transaction_id,
            status_before: RecordStatus::Unmatched,
            status_after: RecordStatus::Unmatched,
            details: serde_json::json!({
                "strategy": proposal.strategy,
                "confidence": proposal.confidence,
                "tier": proposal.tier,
                "scores": proposal.scores,
                "warnings": proposal.warnings,
                "reason": "conflict",
            }),
            created_at,
        }
    }
}
